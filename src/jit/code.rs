//! Finished compilation output.

use super::memory::{AllocError, ExecutableMemory};
use super::session::SessionStats;
use super::CodeOffset;
use crate::vm::{Bci, UnitId};
use serde::Serialize;
use std::fmt;

/// A pool word holding an object address, to be fixed up at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Relocation {
    /// Offset of the pool word.
    pub offset: CodeOffset,
    /// Heap handle of the object.
    pub handle: u32,
    /// Byte offset added to the object's address.
    pub addend: i32,
    /// Size of the pool word in bytes.
    pub width: u32,
}

/// An entry point that picks up a running loop at `bci`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OsrEntry {
    pub bci: Bci,
    pub offset: CodeOffset,
}

/// Compiled code for one unit.
///
/// Entry signature: `(ctx, operand_stack, locals)`.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub(crate) unit: UnitId,
    pub(crate) backend: &'static str,
    pub(crate) code: Vec<u8>,
    pub(crate) entry: CodeOffset,
    pub(crate) osr_entries: Vec<OsrEntry>,
    pub(crate) relocations: Vec<Relocation>,
    pub(crate) literal_offsets: Vec<CodeOffset>,
    pub(crate) frame_slots: u32,
    pub(crate) stats: SessionStats,
}

/// One line of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListingLine {
    pub offset: CodeOffset,
    pub word: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note: String,
}

/// A serializable view of a [`CompiledCode`].
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub unit: u16,
    pub backend: &'static str,
    pub size: usize,
    pub entry: CodeOffset,
    pub frame_slots: u32,
    pub osr_entries: Vec<OsrEntry>,
    pub relocations: Vec<Relocation>,
    pub stats: SessionStats,
    pub lines: Vec<ListingLine>,
}

impl CompiledCode {
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn entry(&self) -> CodeOffset {
        self.entry
    }

    pub fn osr_entries(&self) -> &[OsrEntry] {
        &self.osr_entries
    }

    pub fn osr_entry(&self, bci: Bci) -> Option<CodeOffset> {
        self.osr_entries
            .iter()
            .find(|entry| entry.bci == bci)
            .map(|entry| entry.offset)
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Offsets of literal pool words.
    pub fn literal_offsets(&self) -> &[CodeOffset] {
        &self.literal_offsets
    }

    /// Locals slots the caller must provide, inlined frames included.
    pub fn frame_slots(&self) -> u32 {
        self.frame_slots
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// The word at `at`.
    pub fn word(&self, at: CodeOffset) -> Option<u32> {
        let at = at as usize;
        let bytes = self.code.get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Whether the word at `at` is pool data rather than an instruction.
    pub fn is_literal(&self, at: CodeOffset) -> bool {
        self.literal_offsets.binary_search(&at).is_ok()
    }

    /// Every word with its offset.
    pub fn words(&self) -> impl Iterator<Item = (CodeOffset, u32)> + '_ {
        self.code.chunks_exact(4).enumerate().map(|(i, chunk)| {
            (
                (i * 4) as CodeOffset,
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            )
        })
    }

    fn note(&self, at: CodeOffset) -> String {
        let mut notes = Vec::new();
        if at == self.entry {
            notes.push("entry".to_string());
        }
        for osr in self.osr_entries.iter().filter(|osr| osr.offset == at) {
            notes.push(format!("osr @{}", osr.bci));
        }
        if self.is_literal(at) {
            notes.push("data".to_string());
        }
        for reloc in self.relocations.iter().filter(|reloc| reloc.offset == at) {
            notes.push(format!("reloc obj#{}{:+}", reloc.handle, reloc.addend));
        }
        notes.join(", ")
    }

    pub fn listing(&self) -> Listing {
        Listing {
            unit: self.unit.0,
            backend: self.backend,
            size: self.code.len(),
            entry: self.entry,
            frame_slots: self.frame_slots,
            osr_entries: self.osr_entries.clone(),
            relocations: self.relocations.clone(),
            stats: self.stats.clone(),
            lines: self
                .words()
                .map(|(offset, word)| ListingLine {
                    offset,
                    word: format!("{:08x}", word),
                    note: self.note(offset),
                })
                .collect(),
        }
    }

    /// Copy the code into executable memory, writing the address
    /// `resolve` returns for each relocated handle into its pool word.
    pub fn install(&self, resolve: impl Fn(u32) -> usize) -> Result<ExecutableMemory, AllocError> {
        ExecutableMemory::install(&self.code, &self.relocations, resolve)
    }
}

impl fmt::Display for CompiledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "unit {} ({}): {} bytes, {} frame slots",
            self.unit,
            self.backend,
            self.code.len(),
            self.frame_slots
        )?;
        for (offset, word) in self.words() {
            let note = self.note(offset);
            if note.is_empty() {
                writeln!(f, "  {:04x}: {:08x}", offset, word)?;
            } else {
                writeln!(f, "  {:04x}: {:08x}  ; {}", offset, word, note)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CompiledCode {
        CompiledCode {
            unit: UnitId(3),
            backend: "arm32",
            code: [0xE1A0_0000u32, 0xEAFF_FFFE, 0x1234_5678]
                .iter()
                .flat_map(|w| w.to_le_bytes())
                .collect(),
            entry: 0,
            osr_entries: vec![OsrEntry { bci: 5, offset: 4 }],
            relocations: vec![Relocation {
                offset: 8,
                handle: 2,
                addend: -4,
                width: 4,
            }],
            literal_offsets: vec![8],
            frame_slots: 2,
            stats: SessionStats::default(),
        }
    }

    #[test]
    fn test_words_and_notes() {
        let code = sample();
        assert_eq!(code.word(8), Some(0x1234_5678));
        assert_eq!(code.word(12), None);
        assert!(code.is_literal(8));
        assert_eq!(code.osr_entry(5), Some(4));

        let listing = code.listing();
        assert_eq!(listing.lines.len(), 3);
        assert_eq!(listing.lines[0].note, "entry");
        assert_eq!(listing.lines[1].note, "osr @5");
        assert_eq!(listing.lines[2].note, "data, reloc obj#2-4");
    }

    #[test]
    fn test_display() {
        let text = sample().to_string();
        assert!(text.starts_with("unit #3 (arm32): 12 bytes"));
        assert!(text.contains("  0008: 12345678  ; data"));
    }

    #[test]
    fn test_listing_serializes() {
        let json = serde_json::to_value(sample().listing()).unwrap();
        assert_eq!(json["lines"][0]["word"], "e1a00000");
        assert!(json["lines"][2].get("note").is_some());
        assert_eq!(json["relocations"][0]["addend"], -4);
    }
}
