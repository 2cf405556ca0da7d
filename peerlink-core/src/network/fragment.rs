//! Datagram Fragmentation
//!
//! A serialized peer frame larger than the configured datagram ceiling is
//! split into numbered [`PeerFrame::Fragment`] pieces and reassembled on the
//! receiving side. Fragments may arrive in any order; a duplicate index
//! overwrites the earlier copy. Assemblies are keyed by source address plus
//! fragment id so interleaved transfers from different peers never mix.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use uuid::Uuid;

use super::error::NetworkError;
use super::message::PeerFrame;

/// Caps protecting the reassembly table from abuse.
#[derive(Debug, Clone)]
pub struct FragmentLimits {
    /// Incomplete assemblies older than this are swept.
    pub max_age: Duration,
    /// Maximum number of concurrent incomplete assemblies.
    pub max_assemblies: usize,
    /// Maximum decoded bytes buffered for one assembly.
    pub max_assembly_bytes: usize,
}

impl Default for FragmentLimits {
    fn default() -> Self {
        FragmentLimits {
            max_age: Duration::from_secs(60),
            max_assemblies: 64,
            max_assembly_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Splits a serialized frame into fragment frames of `chunk_bytes` raw bytes
/// each, all sharing a fresh transfer id.
pub fn split_frame(raw: &[u8], chunk_bytes: usize) -> Vec<PeerFrame> {
    let id = Uuid::new_v4().to_string();
    let total = raw.len().div_ceil(chunk_bytes) as u32;
    raw.chunks(chunk_bytes)
        .enumerate()
        .map(|(index, part)| PeerFrame::Fragment {
            id: id.clone(),
            index: index as u32,
            total,
            data: BASE64.encode(part),
        })
        .collect()
}

#[derive(Debug)]
struct Assembly {
    total: u32,
    parts: HashMap<u32, Vec<u8>>,
    first_seen: Instant,
    buffered: usize,
}

impl Assembly {
    fn new(total: u32) -> Self {
        Assembly {
            total,
            parts: HashMap::new(),
            first_seen: Instant::now(),
            buffered: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() as u32 == self.total
    }

    fn concat(mut self) -> Result<Vec<u8>, NetworkError> {
        let mut raw = Vec::with_capacity(self.buffered);
        for index in 0..self.total {
            match self.parts.remove(&index) {
                Some(part) => raw.extend_from_slice(&part),
                None => {
                    return Err(NetworkError::Reassembly(format!(
                        "missing fragment {index} of {}",
                        self.total
                    )))
                }
            }
        }
        Ok(raw)
    }
}

/// Reassembles fragmented datagrams, tolerant of loss, reordering, and
/// duplication.
#[derive(Debug)]
pub struct FragmentAssembler {
    pending: HashMap<(SocketAddr, String), Assembly>,
    limits: FragmentLimits,
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new(FragmentLimits::default())
    }
}

impl FragmentAssembler {
    pub fn new(limits: FragmentLimits) -> Self {
        FragmentAssembler {
            pending: HashMap::new(),
            limits,
        }
    }

    /// Feeds one fragment. Returns the reassembled raw frame once every
    /// index has arrived, `None` while the transfer is still incomplete.
    pub fn accept(
        &mut self,
        source: SocketAddr,
        id: &str,
        index: u32,
        total: u32,
        data: &str,
    ) -> Result<Option<Vec<u8>>, NetworkError> {
        if total == 0 {
            return Err(NetworkError::MalformedFrame(
                "fragment with zero total".to_string(),
            ));
        }
        if index >= total {
            return Err(NetworkError::MalformedFrame(format!(
                "fragment index {index} out of range (total {total})"
            )));
        }
        let bytes = BASE64
            .decode(data)
            .map_err(|e| NetworkError::MalformedFrame(format!("fragment data: {e}")))?;

        if total == 1 {
            return Ok(Some(bytes));
        }

        let key = (source, id.to_string());
        if !self.pending.contains_key(&key) {
            if self.pending.len() >= self.limits.max_assemblies {
                return Err(NetworkError::Reassembly(format!(
                    "too many concurrent transfers (limit {})",
                    self.limits.max_assemblies
                )));
            }
            self.pending.insert(key.clone(), Assembly::new(total));
        }

        let assembly = match self.pending.get_mut(&key) {
            Some(a) => a,
            None => return Err(NetworkError::Reassembly("assembly vanished".to_string())),
        };
        if assembly.total != total {
            return Err(NetworkError::Reassembly(format!(
                "fragment total changed mid-transfer ({} -> {total})",
                assembly.total
            )));
        }

        // Duplicate indexes overwrite the earlier copy.
        let replaced = assembly.parts.remove(&index).map(|old| old.len());
        let new_buffered = assembly.buffered - replaced.unwrap_or(0) + bytes.len();
        if new_buffered > self.limits.max_assembly_bytes {
            self.pending.remove(&key);
            return Err(NetworkError::Reassembly(format!(
                "transfer exceeds {} buffered bytes",
                self.limits.max_assembly_bytes
            )));
        }
        assembly.buffered = new_buffered;
        assembly.parts.insert(index, bytes);

        if assembly.is_complete() {
            match self.pending.remove(&key) {
                Some(done) => done.concat().map(Some),
                None => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    /// Drops incomplete assemblies older than the configured age.
    /// Returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        let max_age = self.limits.max_age;
        let before = self.pending.len();
        self.pending
            .retain(|_, assembly| assembly.first_seen.elapsed() < max_age);
        let swept = before - self.pending.len();
        if swept > 0 {
            log::debug!("swept {swept} stale fragment transfers");
        }
        swept
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn feed(
        assembler: &mut FragmentAssembler,
        source: SocketAddr,
        frame: &PeerFrame,
    ) -> Result<Option<Vec<u8>>, NetworkError> {
        match frame {
            PeerFrame::Fragment {
                id,
                index,
                total,
                data,
            } => assembler.accept(source, id, *index, *total, data),
            other => panic!("not a fragment: {other:?}"),
        }
    }

    #[test]
    fn test_split_covers_all_bytes() {
        let raw: Vec<u8> = (0..=255).collect();
        let frames = split_frame(&raw, 100);
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            match frame {
                PeerFrame::Fragment { index, total, .. } => {
                    assert_eq!(*index, i as u32);
                    assert_eq!(*total, 3);
                }
                other => panic!("not a fragment: {other:?}"),
            }
        }
    }

    #[test]
    fn test_in_order_reassembly() {
        let raw = b"hello fragmented world".to_vec();
        let frames = split_frame(&raw, 5);
        let mut assembler = FragmentAssembler::default();
        let source = addr(9000);

        let mut result = None;
        for frame in &frames {
            result = feed(&mut assembler, source, frame).unwrap();
        }
        assert_eq!(result.unwrap(), raw);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let raw: Vec<u8> = (0..50).collect();
        let mut frames = split_frame(&raw, 7);
        frames.reverse();
        let mut assembler = FragmentAssembler::default();
        let source = addr(9001);

        let mut result = None;
        for frame in &frames {
            result = feed(&mut assembler, source, frame).unwrap();
        }
        assert_eq!(result.unwrap(), raw);
    }

    #[test]
    fn test_duplicate_overwrites_and_completes_once() {
        let raw = b"abcdefghij".to_vec();
        let frames = split_frame(&raw, 4);
        let mut assembler = FragmentAssembler::default();
        let source = addr(9002);

        assert!(feed(&mut assembler, source, &frames[0]).unwrap().is_none());
        assert!(feed(&mut assembler, source, &frames[0]).unwrap().is_none());
        assert!(feed(&mut assembler, source, &frames[1]).unwrap().is_none());
        let result = feed(&mut assembler, source, &frames[2]).unwrap();
        assert_eq!(result.unwrap(), raw);
    }

    #[test]
    fn test_single_fragment_returns_immediately() {
        let raw = b"tiny".to_vec();
        let frames = split_frame(&raw, 100);
        assert_eq!(frames.len(), 1);
        let mut assembler = FragmentAssembler::default();
        let result = feed(&mut assembler, addr(9003), &frames[0]).unwrap();
        assert_eq!(result.unwrap(), raw);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_same_id_different_sources_do_not_mix() {
        let raw_a = b"from alpha".to_vec();
        let raw_b = b"from bravo".to_vec();
        let mut assembler = FragmentAssembler::default();

        // Hand-built fragments sharing an id across two sources.
        let make = |raw: &[u8], index: u32| PeerFrame::Fragment {
            id: "shared".to_string(),
            index,
            total: 2,
            data: BASE64.encode(&raw[index as usize * 5..][..5]),
        };
        assert!(feed(&mut assembler, addr(1), &make(&raw_a, 0)).unwrap().is_none());
        assert!(feed(&mut assembler, addr(2), &make(&raw_b, 0)).unwrap().is_none());
        assert_eq!(assembler.pending_count(), 2);

        let done_b = feed(&mut assembler, addr(2), &make(&raw_b, 1)).unwrap();
        assert_eq!(done_b.unwrap(), raw_b);
        let done_a = feed(&mut assembler, addr(1), &make(&raw_a, 1)).unwrap();
        assert_eq!(done_a.unwrap(), raw_a);
    }

    #[test]
    fn test_invalid_fragments_rejected() {
        let mut assembler = FragmentAssembler::default();
        let source = addr(9004);
        assert!(assembler.accept(source, "x", 0, 0, "AAAA").is_err());
        assert!(assembler.accept(source, "x", 5, 2, "AAAA").is_err());
        assert!(assembler.accept(source, "x", 0, 2, "not base64!").is_err());
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_assembly_table_cap() {
        let mut assembler = FragmentAssembler::new(FragmentLimits {
            max_assemblies: 2,
            ..FragmentLimits::default()
        });
        let source = addr(9005);
        assert!(assembler.accept(source, "a", 0, 2, "AAAA").unwrap().is_none());
        assert!(assembler.accept(source, "b", 0, 2, "AAAA").unwrap().is_none());
        assert!(assembler.accept(source, "c", 0, 2, "AAAA").is_err());
        // Existing transfers still progress.
        assert!(assembler.accept(source, "a", 1, 2, "AAAA").unwrap().is_some());
    }

    #[test]
    fn test_sweep_removes_stale_transfers() {
        let mut assembler = FragmentAssembler::new(FragmentLimits {
            max_age: Duration::ZERO,
            ..FragmentLimits::default()
        });
        let source = addr(9006);
        assert!(assembler.accept(source, "a", 0, 3, "AAAA").unwrap().is_none());
        assert_eq!(assembler.pending_count(), 1);
        assert_eq!(assembler.sweep_expired(), 1);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_byte_cap_aborts_transfer() {
        let mut assembler = FragmentAssembler::new(FragmentLimits {
            max_assembly_bytes: 8,
            ..FragmentLimits::default()
        });
        let source = addr(9007);
        let big = BASE64.encode(vec![0u8; 16]);
        assert!(assembler.accept(source, "a", 0, 2, &big).is_err());
        assert_eq!(assembler.pending_count(), 0);
    }
}
