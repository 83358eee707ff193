//! Process-wide free list of frame buffers.
//!
//! Rust has no GC to make buffer reuse implicit the way the original's
//! `libp2p/go-buffer-pool`-backed pool does; this is a plain mutex-guarded
//! free list keyed by the single capacity class the agent ever allocates,
//! `MAX_FRAME_SIZE`.

use crate::frame::MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};
use std::sync::Mutex;

static POOL: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

/// Borrow a buffer from the pool, allocating a fresh one if the pool is
/// empty. The returned buffer is always cleared and has capacity for at
/// least one full frame.
pub fn get() -> BytesMut {
    let mut pool = POOL.lock().expect("frame pool mutex poisoned");
    match pool.pop() {
        Some(mut buf) => {
            buf.clear();
            buf
        }
        None => BytesMut::with_capacity(MAX_FRAME_SIZE as usize),
    }
}

/// Return a buffer to the pool for reuse.
pub fn put(buf: BytesMut) {
    let mut pool = POOL.lock().expect("frame pool mutex poisoned");
    pool.push(buf);
}

/// Recycle a frame payload once it's no longer needed: if this is the only
/// remaining reference, reclaim the underlying buffer and return it to the
/// pool. If another clone is still alive elsewhere, the bytes can't be
/// reclaimed and are simply dropped.
pub fn recycle(data: Bytes) {
    if let Ok(buf) = data.try_into_mut() {
        put(buf);
    }
}
