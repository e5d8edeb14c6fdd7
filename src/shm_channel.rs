//! Single-slot shared-memory handoff between one producer and many consumers
//!
//! Layout of a segment:
//!
//! ```text
//! +-------------------------+ 0
//! | ShmHeader               |
//! |  init spinlock, magic   |
//! |  flags + frame metadata |
//! |  pthread mutex/condvar  |
//! +-------------------------+ HEADER_SIZE
//! | payload (one frame)     |
//! +-------------------------+ segment size
//! ```
//!
//! Only [`ShmProducer::create`] constructs the process-shared primitives.
//! [`ShmConsumer::attach`] validates the magic under the init spinlock and
//! never touches them otherwise.
//!
//! A [`Frame`] returned by `consume` keeps the header mutex locked until it
//! is dropped, so the producer cannot overwrite a payload that is still
//! being read. Consumers that hold frames for long stall the producer.

use crate::error::{Result, SwitchyardError};
use crate::process::{current_process_id, Liveness, SystemLiveness};
use crate::shm::{Segment, MAX_SEGMENT_SIZE};
use crate::spinlock::{SpinLock, SpinLockState};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Magic number marking an initialized header
const SEGMENT_MAGIC: u32 = 0x5357_5944; // "SWYD"

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

/// Maximum number of dimension values per frame
pub const MAX_DIMENSIONS: usize = 4;

/// How long the producer waits for the init lock at creation
const INIT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(any(target_os = "linux", target_os = "android"))]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

/// Header stored at the beginning of the segment
#[repr(C)]
struct ShmHeader {
    init_lock: SpinLockState,
    magic: AtomicU32,
    is_writing: AtomicU32,
    data_ready: AtomicU32,
    _pad: u32,
    frame_id: AtomicU64,
    data_size: AtomicU64,
    /// f64 bit pattern
    timestamp: AtomicU64,
    data_type_hash: AtomicU64,
    dimensions: [AtomicU64; MAX_DIMENSIONS],
    producer_pid: AtomicU64,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

/// Size reserved for the header; the payload starts right after it
pub const HEADER_SIZE: usize =
    (std::mem::size_of::<ShmHeader>() + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);

fn check(rc: libc::c_int, op: &'static str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(SwitchyardError::Pthread { op, code: rc })
    }
}

impl ShmHeader {
    /// Construct the process-shared mutex and condvar in place
    ///
    /// # Safety
    /// `ptr` must point into a writable mapping and nobody may use the
    /// primitives concurrently. Must only run once per segment lifetime.
    unsafe fn init_primitives(ptr: *mut Self) -> Result<()> {
        let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(
            libc::pthread_mutexattr_init(mattr.as_mut_ptr()),
            "pthread_mutexattr_init",
        )?;
        let mut mattr = mattr.assume_init();
        let mutex_result = (|| -> Result<()> {
            check(
                libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED),
                "pthread_mutexattr_setpshared",
            )?;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            check(
                libc::pthread_mutexattr_setrobust(&mut mattr, libc::PTHREAD_MUTEX_ROBUST),
                "pthread_mutexattr_setrobust",
            )?;
            check(
                libc::pthread_mutex_init((*ptr).mutex.get(), &mattr),
                "pthread_mutex_init",
            )
        })();
        libc::pthread_mutexattr_destroy(&mut mattr);
        mutex_result?;

        let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(
            libc::pthread_condattr_init(cattr.as_mut_ptr()),
            "pthread_condattr_init",
        )?;
        let mut cattr = cattr.assume_init();
        let cond_result = (|| -> Result<()> {
            check(
                libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED),
                "pthread_condattr_setpshared",
            )?;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            check(
                libc::pthread_condattr_setclock(&mut cattr, COND_CLOCK),
                "pthread_condattr_setclock",
            )?;
            check(
                libc::pthread_cond_init((*ptr).cond.get(), &cattr),
                "pthread_cond_init",
            )
        })();
        libc::pthread_condattr_destroy(&mut cattr);
        cond_result
    }

    fn lock(&self) -> Result<HeaderLock<'_>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        self.after_acquire(rc, "pthread_mutex_lock")?;
        Ok(HeaderLock {
            header: self,
            _not_send: PhantomData,
        })
    }

    /// Handle the return code of anything that (re)acquires the mutex
    fn after_acquire(&self, rc: libc::c_int, op: &'static str) -> Result<()> {
        match rc {
            0 => Ok(()),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            libc::EOWNERDEAD => {
                // Previous holder died; a half-written frame must not be served
                warn!(op, "Shared memory mutex owner died, recovering");
                self.is_writing.store(0, Ordering::Release);
                self.data_ready.store(0, Ordering::Release);
                check(
                    unsafe { libc::pthread_mutex_consistent(self.mutex.get()) },
                    "pthread_mutex_consistent",
                )
            }
            code => Err(SwitchyardError::Pthread { op, code }),
        }
    }

    fn frame_info(&self) -> FrameInfo {
        let mut dimensions = [0u64; MAX_DIMENSIONS];
        for (dst, src) in dimensions.iter_mut().zip(self.dimensions.iter()) {
            *dst = src.load(Ordering::Acquire);
        }
        FrameInfo {
            data_size: self.data_size.load(Ordering::Acquire) as usize,
            timestamp: f64::from_bits(self.timestamp.load(Ordering::Acquire)),
            data_type_hash: self.data_type_hash.load(Ordering::Acquire),
            dimensions,
        }
    }
}

/// Held header mutex; unlocks on drop
///
/// pthread mutexes must be released by the locking thread, hence `!Send`.
struct HeaderLock<'a> {
    header: &'a ShmHeader,
    _not_send: PhantomData<*const ()>,
}

impl HeaderLock<'_> {
    fn wait(&self) -> Result<()> {
        let h = self.header;
        let rc = unsafe { libc::pthread_cond_wait(h.cond.get(), h.mutex.get()) };
        h.after_acquire(rc, "pthread_cond_wait")
    }

    /// Returns `false` when the wait timed out
    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let h = self.header;
        let deadline = abs_deadline(timeout);
        let rc = unsafe { libc::pthread_cond_timedwait(h.cond.get(), h.mutex.get(), &deadline) };
        if rc == libc::ETIMEDOUT {
            return Ok(false);
        }
        h.after_acquire(rc, "pthread_cond_timedwait")?;
        Ok(true)
    }

    fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.header.cond.get());
        }
    }
}

impl Drop for HeaderLock<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.header.mutex.get());
        }
    }
}

/// Absolute deadline on the condvar's clock
fn abs_deadline(timeout: Duration) -> libc::timespec {
    let mut now = MaybeUninit::<libc::timespec>::zeroed();
    let mut ts = unsafe {
        libc::clock_gettime(COND_CLOCK, now.as_mut_ptr());
        now.assume_init()
    };

    let mut nsec = ts.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let mut sec = (ts.tv_sec as i64).saturating_add(timeout.as_secs().min(i64::MAX as u64) as i64);
    if nsec >= 1_000_000_000 {
        nsec -= 1_000_000_000;
        sec = sec.saturating_add(1);
    }
    ts.tv_sec = sec as libc::time_t;
    ts.tv_nsec = nsec as _;
    ts
}

fn header_of(segment: &Segment) -> &ShmHeader {
    // SAFETY: segments are at least HEADER_SIZE bytes and page aligned
    unsafe { &*(segment.as_ptr() as *const ShmHeader) }
}

fn already_exists(err: &SwitchyardError) -> bool {
    matches!(err, SwitchyardError::ShmCreate { source, .. }
        if source.kind() == std::io::ErrorKind::AlreadyExists)
}

/// Pid of the live producer owning the existing segment of `channel`
///
/// A segment still being initialized gets [`INIT_LOCK_TIMEOUT`] to publish
/// its magic. After that, or once its recorded producer is dead, it is
/// stale and `None` is returned.
fn live_owner<L: Liveness>(channel: &str, liveness: &L) -> Result<Option<u64>> {
    let deadline = Instant::now() + INIT_LOCK_TIMEOUT;

    loop {
        let segment = match Segment::open(channel) {
            Ok(segment) => Some(segment),
            // Unlinked meanwhile; the retried create decides
            Err(SwitchyardError::ShmOpen { .. }) => return Ok(None),
            // Not yet sized by its creator
            Err(SwitchyardError::CapacityOutOfBounds { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(segment) = segment.filter(|s| s.size() >= HEADER_SIZE) {
            let header = header_of(&segment);
            if header.magic.load(Ordering::Acquire) == SEGMENT_MAGIC {
                let pid = header.producer_pid.load(Ordering::Acquire);
                return Ok((pid != 0 && liveness.is_process_alive(pid)).then_some(pid));
            }
        }

        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn check_segment_size(size: usize) -> Result<()> {
    if size < HEADER_SIZE || size > MAX_SEGMENT_SIZE {
        return Err(SwitchyardError::CapacityOutOfBounds {
            size,
            min: HEADER_SIZE,
            max: MAX_SEGMENT_SIZE,
        });
    }
    Ok(())
}

/// Metadata published alongside a frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameInfo {
    pub data_size: usize,
    pub timestamp: f64,
    pub data_type_hash: u64,
    /// Unused trailing dimensions are 0
    pub dimensions: [u64; MAX_DIMENSIONS],
}

impl FrameInfo {
    pub fn new(data_size: usize) -> Self {
        Self {
            data_size,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_data_type_hash(mut self, hash: u64) -> Self {
        self.data_type_hash = hash;
        self
    }

    /// Set up to [`MAX_DIMENSIONS`] values; extra values are ignored
    pub fn with_dimensions(mut self, dims: &[u64]) -> Self {
        self.dimensions = [0; MAX_DIMENSIONS];
        for (dst, src) in self.dimensions.iter_mut().zip(dims) {
            *dst = *src;
        }
        self
    }
}

/// Producer (writer) side of a shared-memory channel
pub struct ShmProducer {
    segment: Segment,
}

impl ShmProducer {
    /// Create the segment for `channel` and initialize its header
    ///
    /// `size` includes the header; the payload capacity is
    /// `size - HEADER_SIZE`. A segment of a live producer is never touched;
    /// one left behind by a dead producer is unlinked and replaced.
    pub fn create(channel: &str, size: usize) -> Result<Self> {
        Self::create_with_liveness(channel, size, &SystemLiveness)
    }

    /// [`create`](Self::create) with an explicit liveness oracle for the
    /// owner of an existing segment
    pub fn create_with_liveness<L: Liveness>(
        channel: &str,
        size: usize,
        liveness: &L,
    ) -> Result<Self> {
        check_segment_size(size)?;
        let segment = match Segment::create(channel, size) {
            Err(e) if already_exists(&e) => {
                if let Some(pid) = live_owner(channel, liveness)? {
                    return Err(SwitchyardError::SegmentInUse {
                        name: channel.to_string(),
                        pid,
                    });
                }
                warn!(channel, "Replacing stale shared memory segment");
                // Someone else may have unlinked it first
                let _ = Segment::unlink(channel);
                Segment::create(channel, size)?
            }
            other => other?,
        };
        let ptr = segment.as_ptr() as *mut ShmHeader;
        let header = header_of(&segment);

        let init_lock = SpinLock::new(&header.init_lock);
        if !init_lock.try_lock_for(INIT_LOCK_TIMEOUT) {
            return Err(SwitchyardError::InitLockTimeout(channel.to_string()));
        }

        let init = unsafe { ShmHeader::init_primitives(ptr) };
        if init.is_ok() {
            header
                .producer_pid
                .store(current_process_id(), Ordering::Relaxed);
            header.magic.store(SEGMENT_MAGIC, Ordering::Release);
        }
        init_lock.unlock();
        init?;

        debug!(
            channel,
            size,
            capacity = size - HEADER_SIZE,
            "Created shared memory segment"
        );
        Ok(Self { segment })
    }

    /// Payload capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.segment.size() - HEADER_SIZE
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment.size()
    }

    #[inline]
    pub fn channel(&self) -> &str {
        self.segment.channel()
    }

    /// Id of the last completed frame
    #[inline]
    pub fn frame_id(&self) -> u64 {
        header_of(&self.segment).frame_id.load(Ordering::Acquire)
    }

    /// Claim the slot for writing
    ///
    /// Blocks until no consumer holds a frame and no other writer is active.
    pub fn begin_publish(&mut self) -> Result<WriteSlot<'_>> {
        let header = header_of(&self.segment);
        let guard = header.lock()?;
        header.is_writing.store(1, Ordering::Release);
        header.data_ready.store(0, Ordering::Release);

        let payload = unsafe { self.segment.as_ptr().add(HEADER_SIZE) };
        Ok(WriteSlot {
            guard,
            payload,
            capacity: self.capacity(),
            committed: false,
        })
    }

    /// Copy `data` into the slot and publish it
    pub fn publish(&mut self, data: &[u8], info: FrameInfo) -> Result<u64> {
        let capacity = self.capacity();
        if data.len() > capacity {
            return Err(SwitchyardError::BufferOverflow {
                max: capacity,
                got: data.len(),
            });
        }

        let mut slot = self.begin_publish()?;
        slot.payload_mut()[..data.len()].copy_from_slice(data);
        slot.end_publish(FrameInfo {
            data_size: data.len(),
            ..info
        })
    }
}

/// Exclusive write access to the payload region
///
/// Dropping the slot without [`WriteSlot::end_publish`] abandons the frame:
/// `is_writing` is cleared and `data_ready` stays 0.
pub struct WriteSlot<'a> {
    guard: HeaderLock<'a>,
    payload: *mut u8,
    capacity: usize,
    committed: bool,
}

impl WriteSlot<'_> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload, self.capacity) }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish the frame and wake every waiting consumer
    ///
    /// Returns the new frame id.
    pub fn end_publish(mut self, info: FrameInfo) -> Result<u64> {
        if info.data_size > self.capacity {
            return Err(SwitchyardError::BufferOverflow {
                max: self.capacity,
                got: info.data_size,
            });
        }

        let h = self.guard.header;
        h.data_size.store(info.data_size as u64, Ordering::Relaxed);
        h.timestamp.store(info.timestamp.to_bits(), Ordering::Relaxed);
        h.data_type_hash
            .store(info.data_type_hash, Ordering::Relaxed);
        for (dst, src) in h.dimensions.iter().zip(info.dimensions) {
            dst.store(src, Ordering::Relaxed);
        }
        let frame_id = h.frame_id.fetch_add(1, Ordering::AcqRel) + 1;
        h.is_writing.store(0, Ordering::Release);
        h.data_ready.store(1, Ordering::Release);
        self.guard.notify_all();
        self.committed = true;
        Ok(frame_id)
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.guard.header.is_writing.store(0, Ordering::Release);
        }
    }
}

/// Consumer (reader) side of a shared-memory channel
pub struct ShmConsumer {
    segment: Segment,
    last_frame_id: u64,
}

impl ShmConsumer {
    /// Map the segment of `channel` created by a producer
    ///
    /// `lock_timeout` bounds the wait for a producer that is initializing.
    pub fn attach(channel: &str, lock_timeout: Duration) -> Result<Self> {
        let segment = Segment::open(channel)?;
        check_segment_size(segment.size())?;
        let header = header_of(&segment);

        let init_lock = SpinLock::new(&header.init_lock);
        if !init_lock.try_lock_for(lock_timeout) {
            return Err(SwitchyardError::InitLockTimeout(channel.to_string()));
        }
        let magic = header.magic.load(Ordering::Acquire);
        init_lock.unlock();

        if magic != SEGMENT_MAGIC {
            return Err(SwitchyardError::InvalidMagic {
                expected: SEGMENT_MAGIC,
                got: magic,
            });
        }

        let last_frame_id = header.frame_id.load(Ordering::Acquire);
        debug!(channel, size = segment.size(), last_frame_id, "Attached shared memory segment");
        Ok(Self {
            segment,
            last_frame_id,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.segment.size() - HEADER_SIZE
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment.size()
    }

    #[inline]
    pub fn channel(&self) -> &str {
        self.segment.channel()
    }

    /// Id of the last completed frame, read without locking
    #[inline]
    pub fn frame_id(&self) -> u64 {
        header_of(&self.segment).frame_id.load(Ordering::Acquire)
    }

    /// Id of the last frame this consumer returned
    #[inline]
    pub fn last_frame_id(&self) -> u64 {
        self.last_frame_id
    }

    /// Process id recorded by the producer at creation
    pub fn producer_pid(&self) -> u64 {
        header_of(&self.segment).producer_pid.load(Ordering::Acquire)
    }

    /// Wait for a published frame that is not being overwritten
    ///
    /// `None` timeout waits forever. Returns `Ok(None)` on timeout. Frames
    /// already returned before are returned again while no new one exists.
    pub fn consume(&mut self, timeout: Option<Duration>) -> Result<Option<Frame<'_>>> {
        self.wait_frame(timeout, None)
    }

    /// Like [`consume`](Self::consume), but only returns a frame newer than
    /// the last one this consumer saw
    pub fn consume_next(&mut self, timeout: Option<Duration>) -> Result<Option<Frame<'_>>> {
        let seen = self.last_frame_id;
        self.wait_frame(timeout, Some(seen))
    }

    fn wait_frame(
        &mut self,
        timeout: Option<Duration>,
        newer_than: Option<u64>,
    ) -> Result<Option<Frame<'_>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let header = header_of(&self.segment);
        let guard = header.lock()?;

        loop {
            let ready = header.data_ready.load(Ordering::Acquire) != 0
                && header.is_writing.load(Ordering::Acquire) == 0
                && newer_than.map_or(true, |seen| header.frame_id.load(Ordering::Acquire) > seen);
            if ready {
                break;
            }

            match deadline {
                None => guard.wait()?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    guard.wait_timeout(remaining)?;
                }
            }
        }

        let frame_id = header.frame_id.load(Ordering::Acquire);
        let info = header.frame_info();
        let capacity = self.segment.size() - HEADER_SIZE;
        let len = info.data_size.min(capacity);
        let data = unsafe { self.segment.as_ptr().add(HEADER_SIZE) as *const u8 };
        self.last_frame_id = frame_id;

        Ok(Some(Frame {
            _guard: guard,
            data,
            len,
            frame_id,
            info,
        }))
    }
}

/// A published frame, readable while the header mutex is held
pub struct Frame<'a> {
    _guard: HeaderLock<'a>,
    data: *const u8,
    len: usize,
    frame_id: u64,
    info: FrameInfo,
}

impl Frame<'_> {
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn info(&self) -> &FrameInfo {
        &self.info
    }
}

impl std::ops::Deref for Frame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}
