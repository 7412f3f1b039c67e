//! 追記専用のペイロード領域
//!
//! チャンクは容量上限付きのバイト領域と、位置からバイト範囲への
//! スロット索引を持つ。書き込みはキューのコンシューマーだけが
//! `&Chunk` 経由で行い、読み手は `Arc<Chunk>` を共有したまま読む。
//! 領域は必要に応じて伸長し、容量分を先取りしない。
//! 封印後のチャンクは二度と書き込みを受け付けない。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("chunk {0} is sealed")]
    Sealed(usize),

    #[error("chunk is full: need {needed} bytes, {available} available")]
    Full { needed: usize, available: usize },
}

/// チャンク内イベントの created_at の範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: u64,
    pub max: u64,
}

impl TimeRange {
    fn widened(self, created_at: u64) -> Self {
        Self {
            min: self.min.min(created_at),
            max: self.max.max(created_at),
        }
    }

    pub fn span(&self) -> u64 {
        self.max - self.min
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct Arena {
    bytes: Vec<u8>,
    slots: Vec<Slot>,
    time_range: Option<TimeRange>,
    /// 最初に追記したイベントの created_at。時間窓の基準点
    window_start: Option<u64>,
}

#[derive(Debug)]
pub struct Chunk {
    id: usize,
    active: AtomicBool,
    capacity: usize,
    arena: RwLock<Arena>,
}

impl Chunk {
    pub fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            active: AtomicBool::new(true),
            capacity,
            arena: RwLock::new(Arena::default()),
        }
    }

    fn read_arena(&self) -> RwLockReadGuard<'_, Arena> {
        self.arena.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_arena(&self) -> RwLockWriteGuard<'_, Arena> {
        self.arena.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.read_arena().bytes.len()
    }

    /// 実際に確保済みのバイト数
    pub fn allocated_bytes(&self) -> usize {
        self.read_arena().bytes.capacity()
    }

    pub fn len(&self) -> usize {
        self.read_arena().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_arena().slots.is_empty()
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        self.read_arena().time_range
    }

    /// `len` バイト、`created_at` のペイロードを追記できるか
    ///
    /// 時間窓は最初のイベントの created_at から未来方向にだけ数える。
    /// それより古いイベントは容量が許す限り受け入れる。
    pub fn accepts(&self, len: usize, created_at: u64, time_window: u64) -> bool {
        if !self.is_active() {
            return false;
        }
        let arena = self.read_arena();
        if arena.bytes.len() + len > self.capacity {
            return false;
        }
        match arena.window_start {
            Some(start) => created_at.saturating_sub(start) <= time_window,
            None => true,
        }
    }

    /// ペイロードを追記し、スロット索引上の位置を返す
    pub fn append(&self, payload: &[u8], created_at: u64) -> Result<usize, ChunkError> {
        if !self.is_active() {
            return Err(ChunkError::Sealed(self.id));
        }
        let mut arena = self.write_arena();
        let available = self.capacity - arena.bytes.len();
        if payload.len() > available {
            return Err(ChunkError::Full {
                needed: payload.len(),
                available,
            });
        }

        // 倍々で伸ばすが容量上限は超えない
        let needed = arena.bytes.len() + payload.len();
        if needed > arena.bytes.capacity() {
            let target = (arena.bytes.capacity() * 2).clamp(needed, self.capacity);
            let additional = target - arena.bytes.len();
            arena.bytes.reserve_exact(additional);
        }

        let offset = arena.bytes.len();
        arena.bytes.extend_from_slice(payload);
        arena.slots.push(Slot {
            offset,
            len: payload.len(),
        });
        arena.time_range = Some(match arena.time_range {
            Some(range) => range.widened(created_at),
            None => TimeRange {
                min: created_at,
                max: created_at,
            },
        });
        arena.window_start.get_or_insert(created_at);

        Ok(arena.slots.len() - 1)
    }

    /// `position` のペイロードを `f` に渡す。範囲外なら `None`
    pub fn read<T>(&self, position: usize, f: impl FnOnce(&[u8]) -> T) -> Option<T> {
        let arena = self.read_arena();
        let slot = arena.slots.get(position)?;
        arena.bytes.get(slot.offset..slot.offset + slot.len).map(f)
    }

    pub fn seal(&self) {
        self.active.store(false, Ordering::Release);
    }
}
