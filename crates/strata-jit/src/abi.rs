//! Calling convention of compiled code.
//!
//! Every compiled function has the native signature
//! `extern "C" fn(ctx: *mut u8, frame: *mut u64) -> u64`.
//!
//! `ctx` points at an execution context laid out as below. `frame` points at
//! the frame of the unoptimized tier the function runs in: header slots and
//! arguments at non-negative slot indices, locals at negative ones.
//!
//! ```text
//! ctx
//!   +0   u32  exit index written by a firing exit
//!   +4   u32  non-zero once the code has been invalidated
//!   +8   ptr  exit value buffer (u64 per stackmap value)
//!   +16  ptr  inline cache site table (one entry point per site)
//!   +24  u64  stack limit (lowest usable frame slot address)
//!   +32  ptr  linear allocation cursor
//!   +40  ptr  linear allocation end
//!   +48  ptr  free list head per size class
//!
//! frame
//!   slot 0  code block
//!   slot 1  callee
//!   slot 2  argument count including `this`
//!   slot 3+i argument i (0 is `this`)
//!   slot -1-i local i
//! ```

use strata_ir::Operand;

/// Returned by compiled code when an exit fired; the exit index and values are
/// in the context.
///
/// This is the deleted-slot marker, which no user-visible value can be.
pub const EXIT_SENTINEL: u64 = crate::value::VALUE_DELETED;

/// Context offset of the exit index.
pub const CTX_EXIT_INDEX: i32 = 0;
/// Context offset of the invalidation flag.
pub const CTX_INVALIDATED: i32 = 4;
/// Context offset of the exit value buffer pointer.
pub const CTX_EXIT_BUFFER: i32 = 8;
/// Context offset of the inline cache site table pointer.
pub const CTX_SITE_TABLE: i32 = 16;
/// Context offset of the stack limit.
pub const CTX_STACK_LIMIT: i32 = 24;
/// Context offset of the linear allocation cursor.
pub const CTX_LINEAR_CURSOR: i32 = 32;
/// Context offset of the linear allocation end.
pub const CTX_LINEAR_END: i32 = 40;
/// Context offset of the first free list head.
pub const CTX_FREE_LISTS: i32 = 48;
/// Number of size classes with a free list.
pub const NUM_SIZE_CLASSES: usize = 8;
/// Granularity of size classes in bytes.
pub const SIZE_CLASS_STEP: u32 = 16;
/// Total context size in bytes.
pub const CTX_SIZE: usize = CTX_FREE_LISTS as usize + 8 * NUM_SIZE_CLASSES;

/// Frame slot of the code block.
pub const FRAME_CODE_BLOCK: i32 = 0;
/// Frame slot of the callee.
pub const FRAME_CALLEE: i32 = 1;
/// Frame slot of the argument count.
pub const FRAME_ARGUMENT_COUNT: i32 = 2;
/// Number of header slots before argument 0.
pub const FRAME_HEADER_SLOTS: i32 = 3;

/// Slot index of an operand relative to the frame pointer.
pub const fn frame_slot(operand: Operand) -> i32 {
    match operand {
        Operand::Argument(index) => FRAME_HEADER_SLOTS + index as i32,
        Operand::Local(index) => -1 - index as i32,
    }
}

/// Byte offset of an operand relative to the frame pointer.
pub const fn frame_offset(operand: Operand) -> i32 {
    8 * frame_slot(operand)
}

/// Execution context with the layout compiled code expects.
///
/// Embedders own one per thread of execution and pass its address as `ctx`.
#[repr(C)]
#[derive(Debug)]
pub struct ExecutionContext {
    /// Index of the exit that fired last.
    pub exit_index: u32,
    /// Non-zero once the running code has been invalidated.
    pub invalidated: u32,
    /// Buffer receiving the stackmap of a firing exit.
    pub exit_buffer: *mut u64,
    /// Entry point of each inline cache site.
    pub site_table: *const *const u8,
    /// Lowest usable frame slot address.
    pub stack_limit: u64,
    /// Linear allocation cursor.
    pub linear_cursor: *mut u8,
    /// End of the linear allocation region.
    pub linear_end: *mut u8,
    /// Free list head per size class.
    pub free_lists: [*mut u8; NUM_SIZE_CLASSES],
}

const _: () = {
    assert!(std::mem::offset_of!(ExecutionContext, exit_index) == CTX_EXIT_INDEX as usize);
    assert!(std::mem::offset_of!(ExecutionContext, invalidated) == CTX_INVALIDATED as usize);
    assert!(std::mem::offset_of!(ExecutionContext, exit_buffer) == CTX_EXIT_BUFFER as usize);
    assert!(std::mem::offset_of!(ExecutionContext, site_table) == CTX_SITE_TABLE as usize);
    assert!(std::mem::offset_of!(ExecutionContext, stack_limit) == CTX_STACK_LIMIT as usize);
    assert!(std::mem::offset_of!(ExecutionContext, linear_cursor) == CTX_LINEAR_CURSOR as usize);
    assert!(std::mem::offset_of!(ExecutionContext, linear_end) == CTX_LINEAR_END as usize);
    assert!(std::mem::offset_of!(ExecutionContext, free_lists) == CTX_FREE_LISTS as usize);
    assert!(std::mem::size_of::<ExecutionContext>() == CTX_SIZE);
};

impl ExecutionContext {
    /// Context with `exit_buffer` and `site_table` installed and no
    /// allocation region.
    pub fn new(exit_buffer: *mut u64, site_table: *const *const u8) -> Self {
        Self {
            exit_index: 0,
            invalidated: 0,
            exit_buffer,
            site_table,
            stack_limit: 0,
            linear_cursor: std::ptr::null_mut(),
            linear_end: std::ptr::null_mut(),
            free_lists: [std::ptr::null_mut(); NUM_SIZE_CLASSES],
        }
    }

    /// Pointer to pass as `ctx`.
    pub fn as_ptr(&mut self) -> *mut u8 {
        (self as *mut Self).cast()
    }
}

/// Size class serving allocations of `bytes`, if any.
pub fn size_class(bytes: u32) -> Option<usize> {
    let class = bytes.div_ceil(SIZE_CLASS_STEP).saturating_sub(1) as usize;
    (class < NUM_SIZE_CLASSES).then_some(class)
}

/// Context offset of the free list for `class`.
pub const fn free_list_offset(class: usize) -> i32 {
    CTX_FREE_LISTS + 8 * class as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_offsets() {
        assert_eq!(frame_offset(Operand::Argument(0)), 24);
        assert_eq!(frame_offset(Operand::Local(0)), -8);
        assert_eq!(frame_offset(Operand::Local(3)), -32);
    }

    #[test]
    fn size_classes_round_up() {
        assert_eq!(size_class(16), Some(0));
        assert_eq!(size_class(17), Some(1));
        assert_eq!(size_class(128), Some(7));
        assert_eq!(size_class(129), None);
    }

    #[test]
    fn exit_sentinel_is_not_a_user_value() {
        use crate::value::*;
        assert!(!is_number(EXIT_SENTINEL));
        assert!(!is_misc(EXIT_SENTINEL));
        assert_ne!(EXIT_SENTINEL, VALUE_EMPTY);
    }
}
