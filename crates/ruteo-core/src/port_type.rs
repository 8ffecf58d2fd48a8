//! The port-type capability table.
//!
//! A port type is a small capability record: a name, a buffer sizing rule,
//! and two functions — `buffer_init` to put a fresh buffer into a valid
//! empty state, and an optional `mixdown` that merges several source
//! buffers into one input buffer. Types with no `mixdown` simply refuse
//! multiple connections to one input.
//!
//! Audio and MIDI are built in; the table is indexed by [`PortTypeId`],
//! which is what travels in shared memory and over the wire.

use crate::{Nframes, audio, midi};

/// Index into the builtin type table, as stored in [`crate::PortRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTypeId {
    /// `nframes` 32-bit float samples.
    Audio = 0,
    /// Structured MIDI event buffer.
    Midi = 1,
}

impl PortTypeId {
    /// Decode a shared/wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PortTypeId::Audio),
            1 => Some(PortTypeId::Midi),
            _ => None,
        }
    }
}

/// Puts a freshly assigned buffer into a valid empty state.
pub type BufferInitFn = fn(buffer: &mut [u8], nframes: Nframes);

/// Merges `sources` (each a complete source buffer) into `dst`.
pub type MixdownFn = fn(dst: &mut [u8], sources: &[&[u8]], nframes: Nframes);

/// Capability record for one port type.
pub struct PortTypeInfo {
    /// Canonical type name, matched exactly at registration and connect.
    pub name: &'static str,
    /// Table index of this record.
    pub id: PortTypeId,
    /// Buffer bytes per frame. All builtin types share the pool's
    /// `nframes * 4` buffers.
    pub bytes_per_frame: u32,
    /// Empty-state initializer.
    pub buffer_init: BufferInitFn,
    /// Fan-in merge; `None` forbids multiple connections to one input.
    pub mixdown: Option<MixdownFn>,
}

/// Canonical audio type name.
pub const AUDIO_TYPE_NAME: &str = "32 bit float mono audio";

/// Canonical MIDI type name.
pub const MIDI_TYPE_NAME: &str = "8 bit raw midi";

static BUILTIN: [PortTypeInfo; 2] = [
    PortTypeInfo {
        name: AUDIO_TYPE_NAME,
        id: PortTypeId::Audio,
        bytes_per_frame: size_of::<crate::Sample>() as u32,
        buffer_init: audio::buffer_init,
        mixdown: Some(audio::mixdown),
    },
    PortTypeInfo {
        name: MIDI_TYPE_NAME,
        id: PortTypeId::Midi,
        bytes_per_frame: size_of::<crate::Sample>() as u32,
        buffer_init: midi::buffer_init,
        mixdown: Some(midi::mixdown),
    },
];

/// All builtin port types.
pub fn builtin_types() -> &'static [PortTypeInfo] {
    &BUILTIN
}

/// Look a type up by canonical name.
pub fn by_name(name: &str) -> Option<&'static PortTypeInfo> {
    BUILTIN.iter().find(|t| t.name == name)
}

/// Look a type up by id.
pub fn by_id(id: PortTypeId) -> &'static PortTypeInfo {
    &BUILTIN[id as usize]
}

/// Buffer size in bytes for a type at the given period size.
pub fn buffer_bytes(info: &PortTypeInfo, nframes: Nframes) -> usize {
    info.bytes_per_frame as usize * nframes as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_and_id_agree() {
        for t in builtin_types() {
            assert_eq!(by_name(t.name).unwrap().id, t.id);
            assert_eq!(by_id(t.id).name, t.name);
        }
        assert!(by_name("64 bit float mono audio").is_none());
    }
}
