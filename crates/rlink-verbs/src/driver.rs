//! The native verbs surface, as a trait.
//!
//! Everything above this module talks to hardware only through [`Driver`].
//! Raw handles are plain integers; the `*Guard` types own them and release
//! them on drop, so every early return on a partially built resource still
//! cleans up.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::access::Access;
use crate::device::{LinkLayer, PortState};

rlink_types::strong_type!(RawContext, u64);
rlink_types::strong_type!(RawPd, u64);
rlink_types::strong_type!(RawMr, u64);
rlink_types::strong_type!(RawCq, u64);
rlink_types::strong_type!(RawQp, u64);

/// Hardware queue-pair states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwQpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("no such device: {0}")]
    NoSuchDevice(String),
    #[error("no such port {port} on context {context}")]
    NoSuchPort { context: u64, port: u8 },
    #[error("port {0} is not active")]
    PortNotActive(u8),
    #[error("invalid {kind} handle {handle}")]
    InvalidHandle { kind: &'static str, handle: u64 },
    #[error("out of {0}")]
    Exhausted(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("queue pair {qpn}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        qpn: u32,
        from: HwQpState,
        to: HwQpState,
    },
    #[error("remote queue pair {0} is unreachable")]
    PeerUnreachable(u32),
    #[error("queue pair {qpn} cannot post in state {state:?}")]
    NotReady { qpn: u32, state: HwQpState },
    #[error("work queue full")]
    QueueFull,
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Port attributes as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub state: PortState,
    pub link_layer: LinkLayer,
    pub lid: u16,
    pub gid: [u8; 16],
}

/// A registered memory region: its handle and the two keys hardware hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrInfo {
    pub handle: RawMr,
    pub lkey: u32,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_sge: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInfo {
    pub handle: RawQp,
    pub qpn: u32,
}

/// Where the remote half of a connection lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPath {
    pub qpn: u32,
    pub lid: u16,
    pub gid: [u8; 16],
    pub sl: u8,
    pub traffic_class: u8,
}

/// One `modify_qp` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpTransition {
    Reset,
    Init {
        port: u8,
        pkey_index: u16,
        access: Access,
    },
    ReadyToReceive {
        peer: PeerPath,
        path_mtu: u32,
        rq_psn: u32,
        max_dest_rd_atomic: u8,
        min_rnr_timer: u8,
    },
    ReadyToSend {
        sq_psn: u32,
        timeout: u8,
        retry_cnt: u8,
        rnr_retry: u8,
        max_rd_atomic: u8,
    },
}

impl QpTransition {
    pub fn target(&self) -> HwQpState {
        match self {
            QpTransition::Reset => HwQpState::Reset,
            QpTransition::Init { .. } => HwQpState::Init,
            QpTransition::ReadyToReceive { .. } => HwQpState::ReadyToReceive,
            QpTransition::ReadyToSend { .. } => HwQpState::ReadyToSend,
        }
    }
}

/// A scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    Send,
    SendWithImm(u32),
    RdmaWrite,
    RdmaWriteWithImm(u32),
    RdmaRead,
}

impl SendOpcode {
    pub fn is_rdma(&self) -> bool {
        matches!(
            self,
            SendOpcode::RdmaWrite | SendOpcode::RdmaWriteWithImm(_) | SendOpcode::RdmaRead
        )
    }

    pub fn imm(&self) -> Option<u32> {
        match self {
            SendOpcode::SendWithImm(imm) | SendOpcode::RdmaWriteWithImm(imm) => Some(*imm),
            _ => None,
        }
    }
}

/// Target of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub wr_id: u64,
    pub opcode: SendOpcode,
    pub signaled: bool,
    pub sge: Sge,
    pub remote: Option<RemoteTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    RemoteAccessError,
    RemoteInvalidRequest,
    RnrRetryExceeded,
    RetryExceeded,
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
}

/// One completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: CompletionStatus,
    pub opcode: CompletionOpcode,
    pub byte_len: u32,
    pub imm: Option<u32>,
    pub qpn: u32,
}

impl WorkCompletion {
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

/// The native verbs a device driver provides.
///
/// Implementations must be internally synchronized: every method may be
/// called concurrently from several threads.
pub trait Driver: Send + Sync + 'static {
    /// Short name for logs, e.g. `"soft"`.
    fn name(&self) -> &str;

    fn device_names(&self) -> Vec<String>;

    fn open_context(&self, device: &str) -> DriverResult<RawContext>;
    fn close_context(&self, ctx: RawContext);
    fn query_port(&self, ctx: RawContext, port: u8) -> DriverResult<PortAttr>;

    fn alloc_pd(&self, ctx: RawContext) -> DriverResult<RawPd>;
    fn dealloc_pd(&self, pd: RawPd);

    /// Pin `len` bytes at `addr` for access through `pd`.
    ///
    /// # Safety
    /// The memory must stay valid, and must not be freed, until the returned
    /// region is passed to `dereg_mr`. The hardware reads and writes it
    /// behind the compiler's back.
    unsafe fn reg_mr(&self, pd: RawPd, addr: u64, len: usize, access: Access) -> DriverResult<MrInfo>;
    fn dereg_mr(&self, mr: RawMr);

    fn create_cq(&self, ctx: RawContext, entries: u32) -> DriverResult<RawCq>;
    fn destroy_cq(&self, cq: RawCq);
    fn poll_cq(&self, cq: RawCq, max: usize) -> DriverResult<Vec<WorkCompletion>>;

    fn create_qp(&self, pd: RawPd, cq: RawCq, caps: QpCaps) -> DriverResult<QpInfo>;
    fn modify_qp(&self, qp: RawQp, transition: QpTransition) -> DriverResult<()>;
    fn destroy_qp(&self, qp: RawQp);
    fn post_send(&self, qp: RawQp, wr: &SendRequest) -> DriverResult<()>;
    fn post_recv(&self, qp: RawQp, wr: &RecvRequest) -> DriverResult<()>;
}

macro_rules! guard {
    ($(#[$meta:meta])* $guard:ident, $raw:ty, $release:ident) => {
        $(#[$meta])*
        pub struct $guard {
            driver: Arc<dyn Driver>,
            raw: $raw,
        }

        impl $guard {
            pub fn raw(&self) -> $raw {
                self.raw
            }

            pub fn driver(&self) -> &Arc<dyn Driver> {
                &self.driver
            }
        }

        impl Drop for $guard {
            fn drop(&mut self) {
                self.driver.$release(self.raw);
            }
        }

        impl fmt::Debug for $guard {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($guard))
                    .field("driver", &self.driver.name())
                    .field("raw", &self.raw)
                    .finish()
            }
        }
    };
}

guard!(
    /// An open device context; closed on drop.
    ContextGuard, RawContext, close_context
);
guard!(
    /// A protection domain; deallocated on drop.
    PdGuard, RawPd, dealloc_pd
);
guard!(
    /// A pinned memory region; deregistered on drop.
    MrGuard, RawMr, dereg_mr
);
guard!(
    /// A completion queue; destroyed on drop.
    CqGuard, RawCq, destroy_cq
);
guard!(
    /// A queue pair; destroyed on drop.
    QpGuard, RawQp, destroy_qp
);

impl ContextGuard {
    pub fn open(driver: &Arc<dyn Driver>, device: &str) -> DriverResult<Self> {
        let raw = driver.open_context(device)?;
        Ok(Self {
            driver: Arc::clone(driver),
            raw,
        })
    }
}

impl PdGuard {
    pub fn alloc(ctx: &ContextGuard) -> DriverResult<Self> {
        let raw = ctx.driver.alloc_pd(ctx.raw)?;
        Ok(Self {
            driver: Arc::clone(&ctx.driver),
            raw,
        })
    }
}

/// A pinned region plus its keys.
#[derive(Debug)]
pub struct PinnedRegion {
    pub guard: MrGuard,
    pub lkey: u32,
    pub rkey: u32,
}

impl MrGuard {
    /// # Safety
    /// See [`Driver::reg_mr`].
    pub unsafe fn register(
        pd: &PdGuard,
        addr: u64,
        len: usize,
        access: Access,
    ) -> DriverResult<PinnedRegion> {
        let info = unsafe { pd.driver.reg_mr(pd.raw, addr, len, access)? };
        Ok(PinnedRegion {
            guard: Self {
                driver: Arc::clone(&pd.driver),
                raw: info.handle,
            },
            lkey: info.lkey,
            rkey: info.rkey,
        })
    }
}

impl CqGuard {
    pub fn create(ctx: &ContextGuard, entries: u32) -> DriverResult<Self> {
        let raw = ctx.driver.create_cq(ctx.raw, entries)?;
        Ok(Self {
            driver: Arc::clone(&ctx.driver),
            raw,
        })
    }

    pub fn poll(&self, max: usize) -> DriverResult<Vec<WorkCompletion>> {
        self.driver.poll_cq(self.raw, max)
    }
}

impl QpGuard {
    pub fn create(pd: &PdGuard, cq: &CqGuard, caps: QpCaps) -> DriverResult<(Self, u32)> {
        let info = pd.driver.create_qp(pd.raw, cq.raw, caps)?;
        Ok((
            Self {
                driver: Arc::clone(&pd.driver),
                raw: info.handle,
            },
            info.qpn,
        ))
    }

    pub fn modify(&self, transition: QpTransition) -> DriverResult<()> {
        self.driver.modify_qp(self.raw, transition)
    }

    pub fn post_send(&self, wr: &SendRequest) -> DriverResult<()> {
        self.driver.post_send(self.raw, wr)
    }

    pub fn post_recv(&self, wr: &RecvRequest) -> DriverResult<()> {
        self.driver.post_recv(self.raw, wr)
    }
}
