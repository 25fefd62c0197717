//! Store: an ordered collection of [`Span`]s across one or more devices (spec.md §4.1).

use std::{
    collections::HashMap,
    io::{self, Write},
};

use snafu::Snafu;

use crate::span::{DeviceId, Span};

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("not enough free store blocks to satisfy allocation of {requested}"))]
    InsufficientSpace { requested: u64 },

    #[snafu(display("store layout I/O error: {source}"))]
    Io { source: io::Error },
}

impl From<io::Error> for StoreError {
    fn from(source: io::Error) -> Self {
        StoreError::Io { source }
    }
}

/// An ordered collection of spans, across potentially multiple devices.
#[derive(Default, Debug)]
pub struct Store {
    spans: Vec<Span>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self { spans: Vec::new() }
    }

    pub fn add_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    #[must_use]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Allocates `n` store blocks into `out`, either concentrated on one device (`one = true`) or
    /// spread across devices, skipping non-mmap-capable spans when `mmap` is required.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InsufficientSpace`] if the eligible spans do not have `n` blocks of
    /// free capacity between them.
    pub fn alloc(&self, out: &mut Vec<Span>, n: u64, one: bool, mmap: bool) -> Result<(), StoreError> {
        if one {
            self.alloc_one(out, n, mmap)
        } else {
            self.spread_alloc(out, n, mmap)
        }
    }

    fn alloc_one(&self, out: &mut Vec<Span>, n: u64, mmap: bool) -> Result<(), StoreError> {
        let candidate = self
            .spans
            .iter()
            .filter(|s| !mmap || s.mmap_capable)
            .find(|s| s.blocks >= n)
            .cloned();

        match candidate {
            Some(mut span) => {
                span.blocks = n;
                out.push(span);
                Ok(())
            }
            None => Err(StoreError::InsufficientSpace { requested: n }),
        }
    }

    /// Interleaves allocation across devices to balance capacity usage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InsufficientSpace`] if fewer than `n` blocks total are available
    /// across all eligible spans.
    pub fn spread_alloc(&self, out: &mut Vec<Span>, n: u64, mmap: bool) -> Result<(), StoreError> {
        let mut per_device: HashMap<DeviceId, Vec<&Span>> = HashMap::new();
        for span in &self.spans {
            if mmap && !span.mmap_capable {
                continue;
            }
            per_device.entry(span.device).or_default().push(span);
        }

        let total_available: u64 = per_device.values().flatten().map(|s| s.blocks).sum();
        if total_available < n {
            return Err(StoreError::InsufficientSpace { requested: n });
        }

        let num_devices = per_device.len().max(1) as u64;
        let per_device_target = n.div_ceil(num_devices);

        let mut remaining = n;
        for spans in per_device.values() {
            if remaining == 0 {
                break;
            }
            let mut want = per_device_target.min(remaining);
            for span in spans {
                if want == 0 {
                    break;
                }
                let take = want.min(span.blocks);
                if take == 0 {
                    continue;
                }
                let mut allocated = (*span).clone();
                allocated.blocks = take;
                out.push(allocated);
                want -= take;
                remaining -= take;
            }
        }

        if remaining > 0 {
            return Err(StoreError::InsufficientSpace { requested: remaining });
        }

        Ok(())
    }

    /// Re-acquires blocks previously assigned under `want`; blocks that can no longer be
    /// satisfied (because the underlying span shrank or disappeared) are reported in `diff`.
    pub fn try_realloc(&self, want: &[Span], diff: &mut Vec<Span>) {
        for wanted in want {
            let still_available = self
                .spans
                .iter()
                .any(|s| s.device == wanted.device && s.blocks >= wanted.blocks);
            if !still_available {
                diff.push(wanted.clone());
            }
        }
    }

    /// Serializes the layout as a simple line-oriented text format so it can be diffed against the
    /// live device layout after a configuration change.
    ///
    /// # Errors
    ///
    /// Propagates any I/O error from `writer`.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), StoreError> {
        for span in &self.spans {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}",
                span.path.display(),
                span.offset,
                span.blocks,
                span.device.major,
                span.device.minor
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn span(blocks: u64, major: u32, minor: u32) -> Span {
        Span {
            blocks,
            offset: 0,
            sector_size: 512,
            alignment: 512,
            device: DeviceId { major, minor },
            path: PathBuf::from(format!("/dev/sd{major}{minor}")),
            volume_pin: None,
            hash_seed: "seed".into(),
            mmap_capable: true,
        }
    }

    #[test]
    fn alloc_one_picks_a_single_span() {
        let mut store = Store::new();
        store.add_span(span(100, 8, 1));
        store.add_span(span(100, 8, 2));

        let mut out = Vec::new();
        store.alloc(&mut out, 50, true, false).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].blocks, 50);
    }

    #[test]
    fn alloc_one_fails_when_no_span_is_big_enough() {
        let mut store = Store::new();
        store.add_span(span(10, 8, 1));

        let mut out = Vec::new();
        let err = store.alloc(&mut out, 50, true, false).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientSpace { requested: 50 }));
    }

    #[test]
    fn spread_alloc_balances_across_devices() {
        let mut store = Store::new();
        store.add_span(span(100, 8, 1));
        store.add_span(span(100, 8, 2));

        let mut out = Vec::new();
        store.spread_alloc(&mut out, 100, false).unwrap();
        let total: u64 = out.iter().map(|s| s.blocks).sum();
        assert_eq!(total, 100);
        assert!(out.len() >= 2);
    }

    #[test]
    fn spread_alloc_skips_non_mmap_spans_when_required() {
        let mut store = Store::new();
        let mut unmappable = span(100, 8, 1);
        unmappable.mmap_capable = false;
        store.add_span(unmappable);
        store.add_span(span(100, 8, 2));

        let mut out = Vec::new();
        store.spread_alloc(&mut out, 100, true).unwrap();
        assert!(out.iter().all(|s| s.device.minor == 2));
    }
}
