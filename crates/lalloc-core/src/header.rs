//! Block header codec.
//!
//! Layout of one block as handed out by a backend:
//!
//! ```text
//! raw                                   user
//! |<- alignment_padding ->|<-- Header -->|<-- size -->|<- guard ->|
//!                         |      ...guard|            |           |
//! ```
//!
//! The header sits immediately before the user pointer, and the last
//! [`NO_MANS_LAND_SIZE`] bytes of the header are the underrun guard. A second
//! guard follows the user region. Guards and fill patterns exist only with
//! the `debug-memory` feature.
//!
//! Every offset between a user pointer, its header, its raw block and its
//! guards is computed here. Backends only offset within their own pages,
//! and the monitor only follows the `next`/`prev` links.

#![allow(unsafe_code)]

use std::mem::{align_of, size_of};
use std::panic::Location;
use std::ptr::NonNull;

use crate::POINTER_SIZE;
use crate::backend::{AllocOptions, Allocator};
#[cfg(feature = "debug-memory")]
use crate::error::Corruption;
#[cfg(feature = "debug-memory")]
use crate::os::{byte_fill, byte_mismatch};

/// Guard bytes before and after every user region.
#[cfg(feature = "debug-memory")]
pub const NO_MANS_LAND_SIZE: usize = 4;
#[cfg(not(feature = "debug-memory"))]
pub const NO_MANS_LAND_SIZE: usize = 0;

/// Guard pattern.
pub const NO_MANS_LAND_FILL: u8 = 0xFD;
/// Written over freed headers and user regions.
pub const DEAD_LAND_FILL: u8 = 0xDD;
/// Written over fresh user regions to surface reads of uninitialised memory.
pub const CLEAN_LAND_FILL: u8 = 0xCD;

/// Largest supported alignment (alignment and padding are stored as `u16`).
pub const MAX_ALIGNMENT: usize = 1 << 15;

/// Metadata stored immediately before every user pointer.
#[repr(C)]
pub struct Header {
    #[cfg(feature = "debug-memory")]
    pub(crate) next: *mut Header,
    #[cfg(feature = "debug-memory")]
    pub(crate) prev: *mut Header,
    #[cfg(feature = "debug-memory")]
    id: u64,
    #[cfg(feature = "debug-memory")]
    rid: u64,
    #[cfg(feature = "debug-memory")]
    location: Option<&'static Location<'static>>,
    /// Always `self + 1`; checked to catch headers that were trampled.
    #[cfg(feature = "debug-memory")]
    user: *mut u8,
    #[cfg(feature = "debug-memory")]
    options: u64,
    owner: Allocator,
    size: usize,
    alignment: u16,
    alignment_padding: u16,
    #[cfg(feature = "debug-memory")]
    no_mans_land: [u8; NO_MANS_LAND_SIZE],
}

pub const HEADER_SIZE: usize = size_of::<Header>();

/// Smallest alignment handed out; at least pointer width, and enough for
/// the header itself.
pub const MIN_ALIGNMENT: usize = align_of::<Header>();

const _: () = assert!(MIN_ALIGNMENT >= POINTER_SIZE);
const _: () = assert!(MIN_ALIGNMENT <= MAX_ALIGNMENT);
// The underrun guard must not overlap any other field.
const _: () = assert!(
    std::mem::offset_of!(Header, alignment_padding) + size_of::<u16>()
        <= HEADER_SIZE - NO_MANS_LAND_SIZE
);

impl Header {
    /// Requested user size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        usize::from(self.alignment)
    }

    /// Offset from the raw backend block to this header.
    #[must_use]
    pub fn alignment_padding(&self) -> usize {
        usize::from(self.alignment_padding)
    }

    /// Backend that owns the block.
    #[must_use]
    pub fn owner(&self) -> Allocator {
        self.owner
    }

    /// Bytes the backend holds for this block.
    #[must_use]
    pub fn block_len(&self) -> usize {
        // Cannot overflow: the same sum was checked when the block was allocated.
        block_len_unchecked(self.size, self.alignment())
    }

    #[cfg(feature = "debug-memory")]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of times this logical allocation was resized or moved.
    #[cfg(feature = "debug-memory")]
    #[must_use]
    pub fn rid(&self) -> u64 {
        self.rid
    }

    /// Call site of the last allocation or reallocation.
    #[cfg(feature = "debug-memory")]
    #[must_use]
    pub fn location(&self) -> Option<&'static Location<'static>> {
        self.location
    }

    #[cfg(feature = "debug-memory")]
    #[must_use]
    pub fn options(&self) -> AllocOptions {
        AllocOptions::from_bits(self.options)
    }

    #[cfg(feature = "debug-memory")]
    #[must_use]
    pub fn is_marked_as_leak(&self) -> bool {
        self.options().contains(AllocOptions::LEAK)
    }
}

/// Everything [`encode`] records about a block.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    pub owner: Allocator,
    pub size: usize,
    pub alignment: usize,
    pub options: AllocOptions,
    pub id: u64,
    pub rid: u64,
    pub location: &'static Location<'static>,
}

/// Bytes from `addr` up to the next multiple of `alignment`.
#[must_use]
pub fn padding_for_pointer(addr: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    addr.wrapping_neg() & (alignment - 1)
}

/// Smallest padding `>= header_size` such that `addr + padding` is aligned.
#[must_use]
pub fn padding_for_pointer_with_header(addr: usize, alignment: usize, header_size: usize) -> usize {
    let padding = padding_for_pointer(addr, alignment);
    if padding >= header_size {
        return padding;
    }
    padding + (header_size - padding).next_multiple_of(alignment)
}

/// Backend bytes required for `size` user bytes at `alignment`, or `None`
/// on overflow.
#[must_use]
pub fn request_size(size: usize, alignment: usize) -> Option<usize> {
    size.checked_add(alignment)?
        .checked_add(HEADER_SIZE)?
        .checked_add(HEADER_SIZE % alignment)?
        .checked_add(NO_MANS_LAND_SIZE)
}

fn block_len_unchecked(size: usize, alignment: usize) -> usize {
    size + alignment + HEADER_SIZE + HEADER_SIZE % alignment + NO_MANS_LAND_SIZE
}

/// Write a header into `raw` and return the user pointer.
///
/// With `debug-memory` the user region is filled with [`CLEAN_LAND_FILL`]
/// and both guards are written. The header is not linked into any monitor.
///
/// # Safety
///
/// `raw` must be valid for writes of `request_size(info.size, info.alignment)`
/// bytes, and `info.alignment` must be a power of two in
/// `MIN_ALIGNMENT..=MAX_ALIGNMENT`.
pub unsafe fn encode(raw: NonNull<u8>, info: &BlockInfo) -> NonNull<u8> {
    debug_assert!(info.alignment.is_power_of_two());
    debug_assert!((MIN_ALIGNMENT..=MAX_ALIGNMENT).contains(&info.alignment));

    let padding = padding_for_pointer_with_header(raw.as_ptr() as usize, info.alignment, HEADER_SIZE);
    // SAFETY: padding < HEADER_SIZE + alignment, which the request size covers.
    let user = unsafe { raw.add(padding) };
    // SAFETY: padding >= HEADER_SIZE.
    let header = unsafe { user.sub(HEADER_SIZE) }.cast::<Header>();

    let value = Header {
        #[cfg(feature = "debug-memory")]
        next: std::ptr::null_mut(),
        #[cfg(feature = "debug-memory")]
        prev: std::ptr::null_mut(),
        #[cfg(feature = "debug-memory")]
        id: info.id,
        #[cfg(feature = "debug-memory")]
        rid: info.rid,
        #[cfg(feature = "debug-memory")]
        location: Some(info.location),
        #[cfg(feature = "debug-memory")]
        user: user.as_ptr(),
        #[cfg(feature = "debug-memory")]
        options: info.options.bits(),
        owner: info.owner,
        size: info.size,
        alignment: info.alignment as u16,
        alignment_padding: (padding - HEADER_SIZE) as u16,
        #[cfg(feature = "debug-memory")]
        no_mans_land: [NO_MANS_LAND_FILL; NO_MANS_LAND_SIZE],
    };
    // SAFETY: `user` is aligned to at least MIN_ALIGNMENT and HEADER_SIZE is a
    // multiple of it, so `header` is aligned; the bytes are inside `raw`.
    unsafe { header.write(value) };

    #[cfg(feature = "debug-memory")]
    // SAFETY: the guard before, the user region and the guard after all lie
    // inside the requested block.
    unsafe {
        byte_fill(user.as_ptr().sub(NO_MANS_LAND_SIZE), NO_MANS_LAND_FILL, NO_MANS_LAND_SIZE);
        byte_fill(user.as_ptr(), CLEAN_LAND_FILL, info.size);
        write_trailing_guard(header);
    }
    user
}

/// Header of a user pointer.
///
/// # Safety
///
/// `user` must have been returned by [`encode`].
#[must_use]
pub unsafe fn decode(user: NonNull<u8>) -> NonNull<Header> {
    // SAFETY: encode placed the header HEADER_SIZE bytes before `user`.
    unsafe { user.sub(HEADER_SIZE) }.cast()
}

/// User pointer of a header.
#[must_use]
pub fn user_pointer(header: NonNull<Header>) -> NonNull<u8> {
    // SAFETY: one past the header is inside (or one past) the same block.
    unsafe { header.add(1) }.cast()
}

/// Start of the backend block a header lives in.
///
/// # Safety
///
/// `header` must be live.
#[must_use]
pub unsafe fn raw_block(header: NonNull<Header>) -> NonNull<u8> {
    // SAFETY: caller guarantees a live header; alignment_padding bytes precede it.
    unsafe {
        let padding = header.as_ref().alignment_padding();
        header.cast::<u8>().sub(padding)
    }
}

/// Change the recorded size of a block the backend resized in place.
///
/// With `debug-memory`, grown bytes get [`CLEAN_LAND_FILL`], released bytes
/// get [`DEAD_LAND_FILL`], the trailing guard moves to the new end, the
/// RID is bumped and the call site recorded.
///
/// # Safety
///
/// `header` must be live and its block must hold `new_size` user bytes.
pub unsafe fn resize_in_place(
    mut header: NonNull<Header>,
    new_size: usize,
    location: &'static Location<'static>,
) {
    // SAFETY: caller guarantees a live header.
    let h = unsafe { header.as_mut() };
    let old_size = h.size;
    h.size = new_size;

    #[cfg(feature = "debug-memory")]
    {
        h.rid += 1;
        h.location = Some(location);
        let user = h.user;
        // SAFETY: both ranges are inside the old or new block extent.
        unsafe {
            if new_size > old_size {
                byte_fill(user.add(old_size), CLEAN_LAND_FILL, new_size - old_size);
            } else {
                byte_fill(
                    user.add(new_size),
                    DEAD_LAND_FILL,
                    old_size - new_size + NO_MANS_LAND_SIZE,
                );
            }
            write_trailing_guard(header);
        }
    }
    #[cfg(not(feature = "debug-memory"))]
    let _ = (old_size, location);
}

/// Carry the identity of `old` over to a freshly encoded `new` block:
/// same ID, RID + 1, and the leak mark if either had it.
///
/// # Safety
///
/// Both headers must be live.
#[cfg_attr(not(feature = "debug-memory"), allow(unused_mut, unused_variables))]
pub unsafe fn inherit_identity(old: NonNull<Header>, mut new: NonNull<Header>) {
    #[cfg(feature = "debug-memory")]
    // SAFETY: caller guarantees both headers are live and distinct.
    unsafe {
        let old = old.as_ref();
        let new = new.as_mut();
        new.id = old.id;
        new.rid = old.rid + 1;
        new.options |= old.options & AllocOptions::LEAK.bits();
    }
}

/// Overwrite the header, the user region and the trailing guard with
/// [`DEAD_LAND_FILL`].
///
/// # Safety
///
/// `header` must be live; it is garbage afterwards.
pub unsafe fn scrub(header: NonNull<Header>) {
    #[cfg(feature = "debug-memory")]
    // SAFETY: header, user region and trailing guard are contiguous and owned.
    unsafe {
        let len = HEADER_SIZE + header.as_ref().size + NO_MANS_LAND_SIZE;
        byte_fill(header.cast::<u8>().as_ptr(), DEAD_LAND_FILL, len);
    }
    #[cfg(not(feature = "debug-memory"))]
    let _ = header;
}

#[cfg(feature = "debug-memory")]
unsafe fn write_trailing_guard(header: NonNull<Header>) {
    // SAFETY: caller guarantees the guard bytes after the user region are owned.
    unsafe {
        let h = header.as_ref();
        byte_fill(h.user.add(h.size), NO_MANS_LAND_FILL, NO_MANS_LAND_SIZE);
    }
}

/// Integrity check of one header.
///
/// Checked in order: the header is not dead fill, the alignment is sane,
/// the self pointer follows the header, and both guards are intact.
///
/// # Safety
///
/// `header` must point to readable memory of at least `HEADER_SIZE` bytes
/// that once held a header. If the header is intact, its user region and
/// guards must be readable too.
#[cfg(feature = "debug-memory")]
pub unsafe fn verify(header: NonNull<Header>) -> Result<(), Corruption> {
    let p = header.as_ptr();
    let addr = p as usize;
    // Only plain-data fields are read so a trampled header is never
    // materialised as a reference.
    // SAFETY: caller guarantees HEADER_SIZE readable bytes.
    let (id, alignment, user, size) =
        unsafe { ((*p).id, usize::from((*p).alignment), (*p).user, (*p).size) };

    // SAFETY: as above.
    if unsafe { byte_mismatch(p.cast::<u8>(), DEAD_LAND_FILL, HEADER_SIZE) }.is_none() {
        return Err(Corruption::FreedHeader { id, header: addr });
    }
    if alignment == 0 {
        return Err(Corruption::ZeroAlignment { id, header: addr });
    }
    if alignment < POINTER_SIZE {
        return Err(Corruption::AlignmentBelowPointer {
            id,
            header: addr,
            alignment,
        });
    }
    if !alignment.is_power_of_two() {
        return Err(Corruption::AlignmentNotPowerOfTwo {
            id,
            header: addr,
            alignment,
        });
    }
    if user != p.wrapping_add(1).cast::<u8>() {
        return Err(Corruption::SelfReferenceMismatch { id, header: addr });
    }
    // SAFETY: the self pointer checks out, so the guards are part of the block.
    unsafe {
        if let Some(offset) =
            byte_mismatch(user.sub(NO_MANS_LAND_SIZE), NO_MANS_LAND_FILL, NO_MANS_LAND_SIZE)
        {
            return Err(Corruption::UnderrunGuard {
                id,
                header: addr,
                offset,
            });
        }
        if let Some(offset) = byte_mismatch(user.add(size), NO_MANS_LAND_FILL, NO_MANS_LAND_SIZE) {
            return Err(Corruption::OverrunGuard {
                id,
                header: addr,
                offset,
            });
        }
    }
    Ok(())
}
