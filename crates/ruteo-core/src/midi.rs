//! Buffer functions and event API for the builtin MIDI port type.
//!
//! A MIDI buffer is a byte area laid out as
//!
//! ```text
//! [ header | event table, growing up ... free ... payloads, growing down ]
//! ```
//!
//! The header records the period, the buffer's byte size, how many events
//! are stored, how many payload bytes are used from the top end, and how
//! many events were dropped. Each event-table entry is `{time, size,
//! byte_offset}`; payloads are reserved from the top of the buffer
//! downward so the two regions meet in the middle. On overflow the buffer
//! stays intact and `events_lost` is incremented instead.
//!
//! Writers must supply non-decreasing event times. Mixdown is an n-way
//! merge across complete source buffers that preserves time order (and,
//! among equal times, source order) and propagates lost-event counts.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::Nframes;

/// MIDI buffer header, at byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Header {
    nframes: u32,
    buffer_bytes: u32,
    event_count: u32,
    last_write: u32,
    events_lost: u32,
}

/// One event-table entry.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct EventHeader {
    time: u32,
    size: u32,
    byte_offset: u32,
}

/// Byte size of the buffer header.
pub const HEADER_BYTES: usize = size_of::<Header>();

/// Byte size of one event-table entry.
pub const EVENT_BYTES: usize = size_of::<EventHeader>();

/// A decoded event: its frame time and payload bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct MidiEvent<'a> {
    /// Frame offset within the period, `< nframes`.
    pub time: Nframes,
    /// Raw MIDI bytes.
    pub data: &'a [u8],
}

/// Failure to append an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MidiWriteError {
    /// No room, zero size, out-of-range or decreasing time. The buffer's
    /// `events_lost` count has been incremented.
    #[error("no buffer space for midi event")]
    NoSpace,
}

fn load_header(buf: &[u8]) -> Header {
    bytemuck::pod_read_unaligned(&buf[..HEADER_BYTES])
}

fn store_header(buf: &mut [u8], h: &Header) {
    buf[..HEADER_BYTES].copy_from_slice(bytemuck::bytes_of(h));
}

fn load_event(buf: &[u8], idx: u32) -> EventHeader {
    let at = HEADER_BYTES + EVENT_BYTES * idx as usize;
    bytemuck::pod_read_unaligned(&buf[at..at + EVENT_BYTES])
}

fn store_event(buf: &mut [u8], idx: u32, ev: &EventHeader) {
    let at = HEADER_BYTES + EVENT_BYTES * idx as usize;
    buf[at..at + EVENT_BYTES].copy_from_slice(bytemuck::bytes_of(ev));
}

/// Put a fresh buffer into the valid empty state for this period.
pub fn buffer_init(buf: &mut [u8], nframes: Nframes) {
    store_header(
        buf,
        &Header {
            nframes,
            buffer_bytes: buf.len() as u32,
            event_count: 0,
            last_write: 0,
            events_lost: 0,
        },
    );
}

/// Drop all events, keeping the period and size.
///
/// Only meaningful on a buffer the caller is about to write; clearing an
/// input buffer mid-cycle would hide events from downstream readers.
pub fn clear(buf: &mut [u8]) {
    let mut h = load_header(buf);
    h.event_count = 0;
    h.last_write = 0;
    h.events_lost = 0;
    store_header(buf, &h);
}

/// Number of events stored.
pub fn event_count(buf: &[u8]) -> u32 {
    load_header(buf).event_count
}

/// Number of events dropped for lack of space.
pub fn lost_count(buf: &[u8]) -> u32 {
    load_header(buf).events_lost
}

/// Largest payload that could currently be reserved.
pub fn max_event_size(buf: &[u8]) -> usize {
    let h = load_header(buf);
    let used = HEADER_BYTES
        + h.last_write as usize
        + (h.event_count as usize + 1) * EVENT_BYTES;
    (h.buffer_bytes as usize).saturating_sub(used)
}

/// Reserve space for an event and return its payload slice.
///
/// Fails (incrementing `events_lost`) on zero size, a time at or past the
/// period end, a time earlier than the last written event, or exhaustion.
pub fn reserve(buf: &mut [u8], time: Nframes, size: usize) -> Result<&mut [u8], MidiWriteError> {
    let mut h = load_header(buf);

    let ordered = h.event_count == 0 || time >= load_event(buf, h.event_count - 1).time;
    let fits = size > 0
        && h.last_write as usize
            + HEADER_BYTES
            + (h.event_count as usize + 1) * EVENT_BYTES
            + size
            <= h.buffer_bytes as usize;

    if time >= h.nframes || !ordered || !fits {
        h.events_lost += 1;
        store_header(buf, &h);
        return Err(MidiWriteError::NoSpace);
    }

    h.last_write += size as u32;
    let offset = h.buffer_bytes as usize - 1 - h.last_write as usize;
    store_event(
        buf,
        h.event_count,
        &EventHeader {
            time,
            size: size as u32,
            byte_offset: offset as u32,
        },
    );
    h.event_count += 1;
    store_header(buf, &h);

    Ok(&mut buf[offset..offset + size])
}

/// Append an event with the given payload.
pub fn write(buf: &mut [u8], time: Nframes, data: &[u8]) -> Result<(), MidiWriteError> {
    reserve(buf, time, data.len())?.copy_from_slice(data);
    Ok(())
}

/// Read back event `idx`, if present.
pub fn event(buf: &[u8], idx: u32) -> Option<MidiEvent<'_>> {
    let h = load_header(buf);
    if idx >= h.event_count {
        return None;
    }
    let ev = load_event(buf, idx);
    let at = ev.byte_offset as usize;
    Some(MidiEvent {
        time: ev.time,
        data: &buf[at..at + ev.size as usize],
    })
}

/// Merge all `sources` into `dst` in time order.
///
/// Events with equal times keep their source order (strict `<` when
/// scanning for the earliest pending event). If `dst` fills up, the
/// remaining events are counted lost; source lost-counts are inherited
/// either way.
pub fn mixdown(dst: &mut [u8], sources: &[&[u8]], nframes: Nframes) {
    buffer_init(dst, nframes);

    let mut pending: u32 = 0;
    let mut inherited_lost: u32 = 0;
    for src in sources {
        let h = load_header(src);
        pending += h.event_count;
        inherited_lost += h.events_lost;
    }

    let mut cursor = vec![0u32; sources.len()];

    for done in 0..pending {
        let mut earliest: Option<(usize, EventHeader)> = None;
        for (i, src) in sources.iter().enumerate() {
            if cursor[i] >= event_count(src) {
                continue;
            }
            let ev = load_event(src, cursor[i]);
            if earliest.as_ref().is_none_or(|(_, e)| ev.time < e.time) {
                earliest = Some((i, ev));
            }
        }

        let Some((i, ev)) = earliest else { break };
        let src = sources[i];
        let payload = &src[ev.byte_offset as usize..(ev.byte_offset + ev.size) as usize];
        cursor[i] += 1;

        if write(dst, ev.time, payload).is_err() {
            // write() already counted one; account for the rest of the
            // merge that will never fit either.
            let mut h = load_header(dst);
            h.events_lost = pending - done;
            store_header(dst, &h);
            break;
        }
    }

    let mut h = load_header(dst);
    h.events_lost += inherited_lost;
    store_header(dst, &h);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn buffer(nframes: Nframes, bytes: usize) -> Vec<u8> {
        let mut buf = vec![0u8; bytes];
        buffer_init(&mut buf, nframes);
        buf
    }

    #[test]
    fn write_then_read_back() {
        let mut buf = buffer(256, 1024);
        write(&mut buf, 3, &[0x90, 60, 100]).unwrap();
        write(&mut buf, 10, &[0x80, 60, 0]).unwrap();

        assert_eq!(event_count(&buf), 2);
        assert_eq!(lost_count(&buf), 0);
        let e0 = event(&buf, 0).unwrap();
        assert_eq!((e0.time, e0.data), (3, &[0x90u8, 60, 100][..]));
        let e1 = event(&buf, 1).unwrap();
        assert_eq!((e1.time, e1.data), (10, &[0x80u8, 60, 0][..]));
        assert!(event(&buf, 2).is_none());
    }

    #[test]
    fn rejects_decreasing_time_and_bad_sizes() {
        let mut buf = buffer(256, 1024);
        write(&mut buf, 10, &[1]).unwrap();
        assert_eq!(write(&mut buf, 9, &[2]), Err(MidiWriteError::NoSpace));
        assert_eq!(write(&mut buf, 10, &[]), Err(MidiWriteError::NoSpace));
        assert_eq!(write(&mut buf, 256, &[3]), Err(MidiWriteError::NoSpace));
        assert_eq!(lost_count(&buf), 3);
        assert_eq!(event_count(&buf), 1);
    }

    #[test]
    fn overflow_counts_lost_and_preserves_existing() {
        let mut buf = buffer(256, HEADER_BYTES + 2 * EVENT_BYTES + 8);
        write(&mut buf, 0, &[1, 2, 3, 4]).unwrap();
        // Second event fits the table but not the payload region.
        assert!(write(&mut buf, 1, &[5, 6, 7, 8, 9]).is_err());
        assert_eq!(event_count(&buf), 1);
        assert_eq!(lost_count(&buf), 1);
        let e = event(&buf, 0).unwrap();
        assert_eq!(e.data, &[1, 2, 3, 4]);
    }

    #[test]
    fn max_event_size_shrinks_as_events_land() {
        let mut buf = buffer(256, 256);
        let before = max_event_size(&buf);
        write(&mut buf, 0, &[0; 16]).unwrap();
        assert_eq!(max_event_size(&buf), before - 16 - EVENT_BYTES);
    }

    #[test]
    fn mixdown_merges_in_time_order() {
        let mut a = buffer(256, 512);
        let mut b = buffer(256, 512);
        write(&mut a, 0, &[10]).unwrap();
        write(&mut a, 20, &[11]).unwrap();
        write(&mut b, 5, &[20]).unwrap();
        write(&mut b, 20, &[21]).unwrap();

        let mut out = buffer(256, 512);
        mixdown(&mut out, &[&a, &b], 256);

        assert_eq!(event_count(&out), 4);
        assert_eq!(lost_count(&out), 0);
        let times: Vec<u32> = (0..4).map(|i| event(&out, i).unwrap().time).collect();
        assert_eq!(times, [0, 5, 20, 20]);
        // Equal-time events keep source order: a's 20 before b's 21.
        assert_eq!(event(&out, 2).unwrap().data, &[11]);
        assert_eq!(event(&out, 3).unwrap().data, &[21]);
    }

    #[test]
    fn mixdown_inherits_lost_counts() {
        let mut a = buffer(256, HEADER_BYTES + EVENT_BYTES + 2);
        write(&mut a, 0, &[1]).unwrap();
        assert!(write(&mut a, 1, &[2, 3, 4]).is_err());

        let mut out = buffer(256, 512);
        mixdown(&mut out, &[&a], 256);
        assert_eq!(event_count(&out), 1);
        assert_eq!(lost_count(&out), 1);
    }

    proptest! {
        #[test]
        fn roundtrip_when_nothing_lost(
            mut times in proptest::collection::vec(0u32..256, 0..24),
            payload in proptest::collection::vec(1u8..255, 1..8),
        ) {
            times.sort_unstable();
            let mut buf = buffer(256, 4096);
            for &t in &times {
                write(&mut buf, t, &payload).unwrap();
            }
            prop_assert_eq!(lost_count(&buf), 0);
            prop_assert_eq!(event_count(&buf), times.len() as u32);
            for (i, &t) in times.iter().enumerate() {
                let ev = event(&buf, i as u32).unwrap();
                prop_assert_eq!(ev.time, t);
                prop_assert_eq!(ev.data, &payload[..]);
            }
        }
    }
}
