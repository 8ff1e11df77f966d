//! Splitting of payloads that do not fit into a single datagram, and their reassembly on the
//!  receiving side.
//!
//! Each fragment carries a [FragmentHeader]:
//!
//! ```ascii
//! 0: id (u32)             - identifies the original payload, chosen by the sender
//! 4: sequence num (u16)   - 0-based position of this fragment
//! 6: sequence count (u16) - total number of fragments for this id
//! 8: length (u16)         - number of payload bytes following the header
//! ```
//!
//! Fragments may arrive in any order. There is no retransmission: a payload that loses a fragment
//!  is never completed, and its partial state is eventually evicted (least recently updated first)
//!  when newer payloads need room.

use std::collections::VecDeque;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::buffers::read_view::{Cursor, ReadView};
use crate::buffers::write_buffer::WriteBuffer;
use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub id: u32,
    pub sequence_num: u16,
    pub sequence_count: u16,
    pub len: u16,
}

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 10;

    pub fn ser(&self, buf: &mut WriteBuffer) -> anyhow::Result<()> {
        buf.write_u32(self.id)?;
        buf.write_u16(self.sequence_num)?;
        buf.write_u16(self.sequence_count)?;
        buf.write_u16(self.len)
    }

    pub fn deser(view: &ReadView, cursor: &mut Cursor) -> anyhow::Result<FragmentHeader> {
        Ok(FragmentHeader {
            id: view.read_u32(cursor)?,
            sequence_num: view.read_u16(cursor)?,
            sequence_count: view.read_u16(cursor)?,
            len: view.read_u16(cursor)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: u32,
    pub sequence_num: u16,
    pub sequence_count: u16,
    pub payload: Bytes,
}

impl Fragment {
    pub fn header(&self) -> FragmentHeader {
        FragmentHeader {
            id: self.id,
            sequence_num: self.sequence_num,
            sequence_count: self.sequence_count,
            len: self.payload.len().prechecked_cast(),
        }
    }

    /// header followed by the payload slice
    pub fn ser(&self, buf: &mut WriteBuffer) -> anyhow::Result<()> {
        self.header().ser(buf)?;
        buf.write(&self.payload)
    }

    pub fn deser(view: &ReadView, cursor: &mut Cursor) -> anyhow::Result<Fragment> {
        let header = FragmentHeader::deser(view, cursor)?;
        let payload = view.read_slice(cursor, header.len.safe_cast())?;
        Ok(Fragment {
            id: header.id,
            sequence_num: header.sequence_num,
            sequence_count: header.sequence_count,
            payload,
        })
    }
}

struct Reassembly {
    parts: Vec<Option<Bytes>>,
    num_received: usize,
    received_len: usize,
    last_update: u64,
}

impl Reassembly {
    fn is_complete(&self) -> bool {
        self.num_received == self.parts.len()
    }

    fn concat(self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.received_len);
        for part in self.parts.into_iter().flatten() {
            result.extend_from_slice(&part);
        }
        result
    }
}

pub struct Fragmenter {
    fragment_size: usize,
    max_message_size: usize,
    max_reassemblies: usize,
    next_id: u32,
    outgoing: VecDeque<Fragment>,
    reassemblies: FxHashMap<u32, Reassembly>,
    update_counter: u64,
}

impl Fragmenter {
    /// `fragment_size` is the maximum number of payload bytes per fragment, `max_reassemblies`
    ///  the number of incomplete payloads that are tracked concurrently.
    pub fn new(fragment_size: usize, max_message_size: usize, max_reassemblies: usize) -> Fragmenter {
        Self::with_seed(fragment_size, max_message_size, max_reassemblies, rand::random())
    }

    pub fn with_seed(fragment_size: usize, max_message_size: usize, max_reassemblies: usize, id_seed: u32) -> Fragmenter {
        assert!(fragment_size > 0 && fragment_size <= u16::MAX as usize);
        assert!(max_reassemblies > 0);

        Fragmenter {
            fragment_size,
            max_message_size,
            max_reassemblies,
            next_id: id_seed,
            outgoing: VecDeque::new(),
            reassemblies: FxHashMap::default(),
            update_counter: 0,
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// ids are sequential, starting from the seed
    pub fn next_packet_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Split `payload` into fragments and append them to the outgoing queue in sequence order,
    ///  returning the number of fragments.
    pub fn fragment_packet(&mut self, payload: &[u8], id: u32) -> anyhow::Result<usize> {
        if payload.len() > self.max_message_size {
            bail!("payload of {} bytes exceeds the maximum message size of {}", payload.len(), self.max_message_size);
        }
        let sequence_count = payload.len().div_ceil(self.fragment_size).max(1);
        if sequence_count > u16::MAX as usize {
            bail!("payload of {} bytes requires {} fragments, which exceeds the limit", payload.len(), sequence_count);
        }

        let payload = Bytes::copy_from_slice(payload);
        for sequence_num in 0..sequence_count {
            let start = sequence_num * self.fragment_size;
            let end = (start + self.fragment_size).min(payload.len());
            self.outgoing.push_back(Fragment {
                id,
                sequence_num: sequence_num.prechecked_cast(),
                sequence_count: sequence_count.prechecked_cast(),
                payload: payload.slice(start..end),
            });
        }
        trace!("split {} bytes into {} fragments with id {}", payload.len(), sequence_count, id);
        Ok(sequence_count)
    }

    pub fn pop_outgoing(&mut self) -> Option<Fragment> {
        self.outgoing.pop_front()
    }

    pub fn num_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    pub fn num_pending_reassemblies(&self) -> usize {
        self.reassemblies.len()
    }

    /// Add a received fragment, returning the reassembled payload if this fragment completed it.
    ///
    /// Fragments that are inconsistent with their own header or with fragments received before
    ///  for the same id are rejected, leaving all reassembly state unchanged. A reassembly that
    ///  grows beyond the maximum message size is rejected and discarded.
    pub fn defragment_packet(&mut self, fragment: Fragment) -> anyhow::Result<Option<Vec<u8>>> {
        let sequence_count: usize = fragment.sequence_count.safe_cast();
        let sequence_num: usize = fragment.sequence_num.safe_cast();

        if sequence_num >= sequence_count {
            bail!("fragment {} of id {} is outside the sequence count {}", sequence_num, fragment.id, sequence_count);
        }
        if fragment.payload.len() > self.fragment_size {
            bail!("fragment of {} bytes exceeds the fragment size {}", fragment.payload.len(), self.fragment_size);
        }
        if (sequence_count - 1) * self.fragment_size >= self.max_message_size.max(1) {
            bail!("{} fragments of id {} exceed the maximum message size", sequence_count, fragment.id);
        }

        if let Some(existing) = self.reassemblies.get(&fragment.id) {
            if existing.parts.len() != sequence_count {
                bail!("fragment of id {} has sequence count {}, previous fragments had {}", fragment.id, sequence_count, existing.parts.len());
            }
        }
        else if self.reassemblies.len() >= self.max_reassemblies {
            self.evict_least_recently_updated();
        }

        self.update_counter += 1;
        let reassembly = self.reassemblies
            .entry(fragment.id)
            .or_insert_with(|| Reassembly {
                parts: vec![None; sequence_count],
                num_received: 0,
                received_len: 0,
                last_update: 0,
            });
        reassembly.last_update = self.update_counter;

        if reassembly.parts[sequence_num].is_some() {
            trace!("duplicate fragment {} of id {} - ignoring", sequence_num, fragment.id);
            return Ok(None);
        }
        let received_len = reassembly.received_len + fragment.payload.len();
        if received_len > self.max_message_size {
            self.reassemblies.remove(&fragment.id);
            bail!("fragments of id {} add up to more than the maximum message size of {}", fragment.id, self.max_message_size);
        }
        reassembly.received_len = received_len;
        reassembly.num_received += 1;
        reassembly.parts[sequence_num] = Some(fragment.payload);

        if !reassembly.is_complete() {
            return Ok(None);
        }

        let complete = self.reassemblies.remove(&fragment.id)
            .map(Reassembly::concat);
        Ok(complete)
    }

    fn evict_least_recently_updated(&mut self) {
        let oldest = self.reassemblies.iter()
            .min_by_key(|(_, r)| r.last_update)
            .map(|(&id, _)| id);
        if let Some(id) = oldest {
            debug!("evicting incomplete reassembly of id {}", id);
            self.reassemblies.remove(&id);
        }
    }

    pub fn discard_outgoing(&mut self) {
        self.outgoing.clear();
    }

    /// discard all outgoing fragments and partial reassemblies
    pub fn clear(&mut self) {
        self.outgoing.clear();
        self.reassemblies.clear();
    }
}
