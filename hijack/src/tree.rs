// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Longest-prefix-match index over configured prefixes. One binary
//! bit trie per address family; nodes exist for every inserted prefix
//! and lookup returns the deepest configured node covering the query.

use crate::types::Prefix;

#[derive(Debug)]
struct Node<T> {
    /// Payload for a configured prefix. Interior nodes created while
    /// walking toward a longer prefix carry none.
    value: Option<(Prefix, T)>,
    zero: Option<Box<Node<T>>>,
    one: Option<Box<Node<T>>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            value: None,
            zero: None,
            one: None,
        }
    }

    fn child_mut(&mut self, bit: bool) -> &mut Option<Box<Node<T>>> {
        if bit {
            &mut self.one
        } else {
            &mut self.zero
        }
    }

    fn child(&self, bit: bool) -> Option<&Node<T>> {
        if bit {
            self.one.as_deref()
        } else {
            self.zero.as_deref()
        }
    }
}

/// A longest-prefix-match trie. The payload type is arbitrary so the
/// same structure serves both rule lookup and auto-ignore matching.
#[derive(Debug)]
pub struct PrefixTree<T> {
    v4: Node<T>,
    v6: Node<T>,
    len: usize,
}

impl<T> Default for PrefixTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PrefixTree<T> {
    pub fn new() -> Self {
        Self {
            v4: Node::new(),
            v6: Node::new(),
            len: 0,
        }
    }

    /// Number of configured prefixes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn root(&self, prefix: &Prefix) -> &Node<T> {
        match prefix {
            Prefix::V4(_) => &self.v4,
            Prefix::V6(_) => &self.v6,
        }
    }

    fn root_mut(&mut self, prefix: &Prefix) -> &mut Node<T> {
        match prefix {
            Prefix::V4(_) => &mut self.v4,
            Prefix::V6(_) => &mut self.v6,
        }
    }

    /// Insert `prefix`, initializing an absent node's payload with
    /// `init` and otherwise applying `merge` to the existing payload.
    /// Re-inserting a prefix therefore appends rather than duplicating
    /// the node.
    pub fn insert_with<F, M>(&mut self, prefix: Prefix, init: F, merge: M)
    where
        F: FnOnce() -> T,
        M: FnOnce(&mut T),
    {
        let mut node = self.root_mut(&prefix);
        for i in 0..prefix.length() {
            let bit = prefix.bit(i);
            node = node.child_mut(bit).get_or_insert_with(|| {
                Box::new(Node::new())
            });
        }
        match node.value {
            Some((_, ref mut value)) => merge(value),
            None => {
                node.value = Some((prefix, init()));
                self.len += 1;
            }
        }
    }

    /// The most specific configured prefix covering `prefix`, with its
    /// payload. The query need not itself be configured; an exact
    /// match wins over any shorter covering supernet. `None` means no
    /// configured ancestor exists at all.
    pub fn lookup(&self, prefix: &Prefix) -> Option<(&Prefix, &T)> {
        let mut node = self.root(prefix);
        let mut best = node.value.as_ref();
        for i in 0..prefix.length() {
            match node.child(prefix.bit(i)) {
                Some(next) => {
                    node = next;
                    if node.value.is_some() {
                        best = node.value.as_ref();
                    }
                }
                None => break,
            }
        }
        best.map(|(p, v)| (p, v))
    }

    /// The payload for exactly `prefix`, ignoring covering supernets.
    pub fn get(&self, prefix: &Prefix) -> Option<&T> {
        let mut node = self.root(prefix);
        for i in 0..prefix.length() {
            node = node.child(prefix.bit(i))?;
        }
        match node.value {
            Some((ref p, ref v)) if p == prefix => Some(v),
            _ => None,
        }
    }

    /// Visit every configured (prefix, payload) pair.
    pub fn iter(&self) -> impl Iterator<Item = (&Prefix, &T)> {
        let mut stack: Vec<&Node<T>> = vec![&self.v4, &self.v6];
        std::iter::from_fn(move || {
            while let Some(node) = stack.pop() {
                if let Some(child) = node.zero.as_deref() {
                    stack.push(child);
                }
                if let Some(child) = node.one.as_deref() {
                    stack.push(child);
                }
                if let Some((ref p, ref v)) = node.value {
                    return Some((p, v));
                }
            }
            None
        })
    }
}
