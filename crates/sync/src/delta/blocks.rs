// Block sequence edits that keep the `block_above_uuid` chain consistent.

use serde_json::Value;
use uuid::Uuid;

use chatbook_common::patch::{patch_typed, PatchError, PatchMode};
use chatbook_common::types::{Block, Notebook};

use super::DeltaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockUpsert {
    /// A block with the same UUID was already present.
    Replaced,
    Inserted,
}

/// Insert `block` after its declared predecessor, or replace it in place if
/// its UUID is already present.
///
/// A null predecessor inserts at the head. The block that used to follow the
/// insertion point is re-pointed at the new block.
pub fn upsert_block(notebook: &mut Notebook, block: Block) -> Result<BlockUpsert, DeltaError> {
    let uuid = block.uuid;
    if let Some(existing) = notebook.blocks.iter_mut().find(|existing| existing.uuid == uuid) {
        *existing = block;
        return Ok(BlockUpsert::Replaced);
    }

    if notebook.blocks.is_empty() {
        notebook.blocks.push(block);
        return Ok(BlockUpsert::Inserted);
    }

    let index = match block.block_above_uuid {
        None => 0,
        Some(above) => {
            let Some(position) = notebook.blocks.iter().position(|b| b.uuid == above) else {
                return Err(DeltaError::MissingPredecessor {
                    notebook_id: notebook.metadata.id,
                    block_uuid: block.uuid,
                    block_above_uuid: above,
                });
            };
            position + 1
        }
    };

    if let Some(successor) =
        notebook.blocks.iter_mut().find(|b| b.block_above_uuid == block.block_above_uuid)
    {
        successor.block_above_uuid = Some(block.uuid);
    }
    notebook.blocks.insert(index, block);
    Ok(BlockUpsert::Inserted)
}

/// Remove a block and hand its predecessor to its successor. Returns false
/// if the block is not present.
pub fn remove_block(notebook: &mut Notebook, uuid: Uuid) -> bool {
    let Some(index) = notebook.blocks.iter().position(|b| b.uuid == uuid) else {
        return false;
    };
    let removed = notebook.blocks.remove(index);
    if let Some(successor) = notebook.blocks.iter_mut().find(|b| b.block_above_uuid == Some(uuid)) {
        successor.block_above_uuid = removed.block_above_uuid;
    }
    true
}

/// Deep-set a field on a block. `Ok(false)` means the block is not present.
pub fn patch_block<S: AsRef<str>>(
    notebook: &mut Notebook,
    uuid: Uuid,
    path: &[S],
    value: Value,
    mode: PatchMode,
) -> Result<bool, PatchError> {
    let Some(block) = notebook.blocks.iter_mut().find(|b| b.uuid == uuid) else {
        return Ok(false);
    };
    *block = patch_typed(&*block, path, value, mode)?;
    Ok(true)
}
