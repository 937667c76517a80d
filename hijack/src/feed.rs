// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collector feed adapters. Every feed type reduces to the same
//! capability: a lazy, restartable sequence of raw records that the
//! normalizer turns into canonical updates. Live adapters plug in
//! behind [`UpdateSource`]; the JSON-lines source here covers replay
//! of archived feeds.

use crate::error::Error;
use crate::log::hijack_log;
use crate::update::RawUpdate;
use slog::Logger;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

pub trait UpdateSource {
    /// Collector identity, for logging and the update `service` tag.
    fn name(&self) -> &str;

    /// The next raw record, or `None` when the source is exhausted.
    fn next_update(&mut self) -> Result<Option<RawUpdate>, Error>;

    /// Rewind to the beginning of the sequence where the medium
    /// allows it.
    fn restart(&mut self) -> Result<(), Error>;
}

/// Replays newline-delimited JSON update records from a file.
/// Malformed lines are dropped with a logged reason rather than
/// aborting the replay.
pub struct JsonLinesSource {
    name: String,
    path: PathBuf,
    reader: BufReader<File>,
    log: Logger,
}

impl JsonLinesSource {
    pub fn open(
        name: &str,
        path: impl Into<PathBuf>,
        log: Logger,
    ) -> Result<Self, Error> {
        let path = path.into();
        let reader = BufReader::new(File::open(&path)?);
        Ok(Self {
            name: name.to_string(),
            path,
            reader,
            log,
        })
    }
}

impl UpdateSource for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_update(&mut self) -> Result<Option<RawUpdate>, Error> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawUpdate>(line) {
                Ok(raw) => return Ok(Some(raw)),
                Err(e) => {
                    hijack_log!(
                        self.log,
                        warn,
                        crate::MOD_FEED,
                        "dropping malformed record: {}",
                        e;
                        "source" => self.name.clone()
                    );
                }
            }
        }
    }

    fn restart(&mut self) -> Result<(), Error> {
        self.reader = BufReader::new(File::open(&self.path)?);
        Ok(())
    }
}
