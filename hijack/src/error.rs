// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("invalid path hop: {0}")]
    InvalidPathHop(String),

    #[error("timestamp {0} outside accepted window")]
    TimestampOutOfWindow(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("channel send: {0}")]
    ChannelSend(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error {0}")]
    Serialization(#[from] serde_json::Error),
}
