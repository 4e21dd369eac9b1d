// memory.rs — Memory kinds and the accelerator tile pool
//
// `Memory` tags where a buffer lives. `TileAllocator` models the matrix
// accelerator's register file: eight 4×4 tiles handed out first-fit and
// named `m7` down to `m0`. The allocator is an explicit object owned by
// whoever generates code; each code generation run starts from a fresh pool.
//
// Failure modes: non-4×4 shapes, pool exhaustion, and freeing an unknown
//                name produce `MemGenError`.
// Side effects: none outside the allocator value.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use derive_more::{Display, Error};
use serde::Serialize;

use crate::ast::Expr;

// ── Memory kinds ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Memory {
    /// Heap memory, `malloc`/`free` per allocation.
    Dram,
    /// Statically allocated memory; readable wherever `Dram` is.
    DramStatic,
    /// Accelerator tile register; not addressable element-wise.
    RvmTile,
}

impl Memory {
    pub fn name(self) -> &'static str {
        match self {
            Memory::Dram => "DRAM",
            Memory::DramStatic => "DRAM_STATIC",
            Memory::RvmTile => "RVM_TILE",
        }
    }

    /// Whether a buffer living in `actual` may be passed where `self` is
    /// expected.
    pub fn accepts(self, actual: Memory) -> bool {
        match self {
            Memory::Dram => matches!(actual, Memory::Dram | Memory::DramStatic),
            other => other == actual,
        }
    }

    /// Whether generated code may read or write individual elements.
    pub fn can_index(self) -> bool {
        !matches!(self, Memory::RvmTile)
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Memory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAM" => Ok(Memory::Dram),
            "DRAM_STATIC" => Ok(Memory::DramStatic),
            "RVM_TILE" => Ok(Memory::RvmTile),
            other => Err(format!(
                "unknown memory '{}' (expected DRAM, DRAM_STATIC or RVM_TILE)",
                other
            )),
        }
    }
}

// ── Tile allocator ──────────────────────────────────────────────────────────

pub const NUM_RVM_TILES: usize = 8;
const TILE_ROWS: i64 = 4;
const TILE_COLS: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum MemGenError {
    #[display("{name}: must be a 2D tile, found {rank} dimensions")]
    NotTwoDimensional { name: String, rank: usize },
    #[display("{name}: number of tile rows must be 4")]
    BadRows { name: String },
    #[display("{name}: number of tile columns must be 4")]
    BadCols { name: String },
    #[display("{name}: all 8 accelerator tiles are in use")]
    Exhausted { name: String },
    #[display("{name}: not an allocated tile")]
    UnknownTile { name: String },
}

/// First-fit pool of accelerator tiles.
#[derive(Debug, Clone)]
pub struct TileAllocator {
    in_use: [bool; NUM_RVM_TILES],
    tiles: HashMap<String, usize>,
}

impl Default for TileAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TileAllocator {
    pub fn new() -> Self {
        Self {
            in_use: [false; NUM_RVM_TILES],
            tiles: HashMap::new(),
        }
    }

    /// Release every tile.
    pub fn reset(&mut self) {
        self.in_use = [false; NUM_RVM_TILES];
        self.tiles.clear();
    }

    /// Bind `name` to a free tile and return the C preprocessor line that
    /// names its register.
    pub fn alloc(&mut self, name: &str, shape: &[Expr]) -> Result<String, MemGenError> {
        if shape.len() != 2 {
            return Err(MemGenError::NotTwoDimensional {
                name: name.to_string(),
                rank: shape.len(),
            });
        }
        if shape[0].as_int() != Some(TILE_ROWS) {
            return Err(MemGenError::BadRows {
                name: name.to_string(),
            });
        }
        if shape[1].as_int() != Some(TILE_COLS) {
            return Err(MemGenError::BadCols {
                name: name.to_string(),
            });
        }
        let slot = self
            .in_use
            .iter()
            .position(|used| !used)
            .ok_or_else(|| MemGenError::Exhausted {
                name: name.to_string(),
            })?;
        self.in_use[slot] = true;
        self.tiles.insert(name.to_string(), slot);
        Ok(format!(
            "#define {} \"m{}\"",
            name,
            NUM_RVM_TILES - 1 - slot
        ))
    }

    /// Return the tile bound to `name` to the pool.
    pub fn free(&mut self, name: &str) -> Result<String, MemGenError> {
        let slot = self
            .tiles
            .remove(name)
            .ok_or_else(|| MemGenError::UnknownTile {
                name: name.to_string(),
            })?;
        self.in_use[slot] = false;
        Ok(format!("#undef {}", name))
    }

    pub fn in_use(&self) -> usize {
        self.tiles.len()
    }
}
