//! Reliable connections: one queue pair, its handshake and its data path.

use std::fmt;
use std::sync::Arc;

use rlink_serde::{WireDeserialize, WireError, WireSerialize, WireSize};
use rlink_types::status_code::{QpCode, StatusCode};
use rlink_types::{make_error_msg, QpNum, Result, Status};

use crate::access::Access;
use crate::config::QpConfig;
use crate::device::Device;
use crate::driver::{
    CqGuard, DriverError, DriverResult, PeerPath, QpCaps, QpGuard, QpTransition, RecvRequest,
    RemoteTarget, SendOpcode, SendRequest, Sge, WorkCompletion,
};
use crate::memory::{LocalAttr, MemoryAttr};

/// What a peer needs to connect to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub qpn: QpNum,
    pub port: u8,
    /// InfiniBand local id; 0 on RoCE.
    pub lid: u16,
    pub gid: [u8; 16],
    /// First packet sequence number this endpoint sends.
    pub psn: u32,
}

impl WireSize for ConnectionIdentity {
    const WIRE_SIZE: usize = 4 + 1 + 2 + 16 + 4;
}

impl WireSerialize for ConnectionIdentity {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> std::result::Result<(), WireError> {
        self.qpn.get().wire_serialize(buf)?;
        self.port.wire_serialize(buf)?;
        self.lid.wire_serialize(buf)?;
        self.gid.wire_serialize(buf)?;
        self.psn.wire_serialize(buf)
    }
}

impl WireDeserialize for ConnectionIdentity {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> std::result::Result<Self, WireError> {
        Ok(Self {
            qpn: QpNum(u32::wire_deserialize(buf, offset)?),
            port: u8::wire_deserialize(buf, offset)?,
            lid: u16::wire_deserialize(buf, offset)?,
            gid: <[u8; 16]>::wire_deserialize(buf, offset)?,
            psn: u32::wire_deserialize(buf, offset)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    Created,
    Connected,
    /// The peer rejected the handshake; `reset()` before trying again.
    Failed,
    Destroyed,
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QpState::Created => write!(f, "CREATED"),
            QpState::Connected => write!(f, "CONNECTED"),
            QpState::Failed => write!(f, "FAILED"),
            QpState::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// One-sided read from the bound remote region into local memory.
    Read,
    /// One-sided write from local memory into the bound remote region.
    Write,
    /// Two-sided send, consumed by a receive the peer posted.
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkDescriptor {
    pub kind: WorkKind,
    pub signaled: bool,
    pub length: u32,
    /// Returned unchanged in the completion.
    pub wr_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressDescriptor {
    /// Absolute address inside the bound local region.
    pub local_addr: u64,
    /// Offset from the base of the bound remote region. Ignored by sends.
    pub remote_offset: u64,
    /// Immediate data; valid for sends and writes.
    pub imm: Option<u32>,
}

/// One reliable-connected queue pair and its completion queue.
///
/// Runs `Created -> Connected` through [`connect`](Self::connect), or
/// `Created -> Failed` when the handshake is rejected. `Destroyed` is
/// terminal. Owned by its creator; `connect` takes `&mut self`.
pub struct ReliableConnection {
    // Field order is drop order: the queue pair before its completion queue,
    // both before the device.
    qp: Option<QpGuard>,
    cq: Option<CqGuard>,
    device: Arc<Device>,
    config: QpConfig,
    qpn: QpNum,
    state: QpState,
    local: Option<LocalAttr>,
    remote: Option<MemoryAttr>,
}

fn resource_error(what: &str, e: DriverError) -> Status {
    Status::with_message(QpCode::RESOURCE_ERROR, format!("{what}: {e}"))
}

impl ReliableConnection {
    pub fn create(device: &Arc<Device>, config: QpConfig) -> Result<Self> {
        config.validate()?;
        if !device.ready() {
            return make_error_msg(
                QpCode::RESOURCE_ERROR,
                format!("device {} is not ready", device.name()),
            );
        }

        let cq = CqGuard::create(device.context(), config.cq_entries())
            .map_err(|e| resource_error("create completion queue", e))?;
        let caps = QpCaps {
            max_send_wr: config.max_send_wr,
            max_recv_wr: config.max_recv_wr,
            max_sge: config.max_sge,
        };
        let (qp, qpn) =
            QpGuard::create(device.pd(), &cq, caps).map_err(|e| resource_error("create queue pair", e))?;
        qp.modify(QpTransition::Reset)
            .map_err(|e| resource_error("reset queue pair", e))?;

        tracing::debug!(device = device.name(), qpn, "queue pair created");
        Ok(Self {
            qp: Some(qp),
            cq: Some(cq),
            device: Arc::clone(device),
            config,
            qpn: QpNum(qpn),
            state: QpState::Created,
            local: None,
            remote: None,
        })
    }

    pub fn identity(&self) -> ConnectionIdentity {
        let port = self.device.port();
        ConnectionIdentity {
            qpn: self.qpn,
            port: port.port_num,
            lid: if port.is_roce() { 0 } else { port.lid },
            gid: port.gid,
            psn: self.config.start_psn,
        }
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    pub fn qpn(&self) -> QpNum {
        self.qpn
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn config(&self) -> &QpConfig {
        &self.config
    }

    fn live_qp(&self) -> Result<&QpGuard> {
        match &self.qp {
            Some(qp) => Ok(qp),
            None => make_error_msg(QpCode::INVALID_STATE, format!("queue pair {} destroyed", self.qpn)),
        }
    }

    fn handshake(&self, qp: &QpGuard, peer: &ConnectionIdentity) -> DriverResult<()> {
        let config = &self.config;
        let steps = [
            QpTransition::Reset,
            QpTransition::Init {
                port: self.device.port().port_num,
                pkey_index: config.pkey_index,
                access: Access::all(),
            },
            QpTransition::ReadyToReceive {
                peer: PeerPath {
                    qpn: peer.qpn.get(),
                    lid: peer.lid,
                    gid: peer.gid,
                    sl: config.sl,
                    traffic_class: config.traffic_class,
                },
                path_mtu: config.path_mtu,
                rq_psn: peer.psn,
                max_dest_rd_atomic: config.max_rd_atomic,
                min_rnr_timer: config.min_rnr_timer,
            },
            QpTransition::ReadyToSend {
                sq_psn: config.start_psn,
                timeout: config.timeout,
                retry_cnt: config.retry_cnt,
                rnr_retry: config.rnr_retry,
                max_rd_atomic: config.max_rd_atomic,
            },
        ];
        for step in steps {
            qp.modify(step)?;
            tracing::debug!(qpn = %self.qpn, state = ?step.target(), "queue pair transition");
        }
        Ok(())
    }

    /// Run the handshake against `peer`: reset, init, ready-to-receive,
    /// ready-to-send.
    ///
    /// A connected endpoint fails with `ALREADY_CONNECTED` and stays
    /// connected. A rejected handshake fails with `HANDSHAKE_ERROR` and leaves
    /// the endpoint `Failed` until `reset()`.
    pub fn connect(&mut self, peer: &ConnectionIdentity) -> Result<()> {
        match self.state {
            QpState::Created => {}
            QpState::Connected => {
                return make_error_msg(
                    QpCode::ALREADY_CONNECTED,
                    format!("queue pair {} already connected", self.qpn),
                )
            }
            QpState::Failed | QpState::Destroyed => {
                return make_error_msg(
                    QpCode::INVALID_STATE,
                    format!("cannot connect queue pair {} in state {}", self.qpn, self.state),
                )
            }
        }

        let qp = self.live_qp()?;
        match self.handshake(qp, peer) {
            Ok(()) => {
                tracing::debug!(qpn = %self.qpn, peer = %peer.qpn, "queue pair connected");
                self.state = QpState::Connected;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(qpn = %self.qpn, peer = %peer.qpn, error = %e, "handshake rejected");
                self.state = QpState::Failed;
                make_error_msg(QpCode::HANDSHAKE_ERROR, e.to_string())
            }
        }
    }

    /// Return the endpoint to `Created` so `connect` can run again. Bindings
    /// are kept.
    pub fn reset(&mut self) -> Result<()> {
        let qp = self.live_qp()?;
        qp.modify(QpTransition::Reset)
            .map_err(|e| Status::with_message(QpCode::TRANSPORT_ERROR, e.to_string()))?;
        tracing::debug!(qpn = %self.qpn, from = %self.state, "queue pair reset");
        self.state = QpState::Created;
        Ok(())
    }

    /// Bind the local region operations read from and write into, replacing
    /// any previous binding.
    pub fn bind_local(&mut self, attr: LocalAttr) -> Result<()> {
        self.live_qp()?;
        self.local = Some(attr);
        Ok(())
    }

    /// Bind the peer region one-sided operations target, replacing any
    /// previous binding.
    pub fn bind_remote(&mut self, attr: MemoryAttr) -> Result<()> {
        self.live_qp()?;
        self.remote = Some(attr);
        Ok(())
    }

    fn check_connected(&self) -> Result<&QpGuard> {
        let qp = self.live_qp()?;
        if self.state != QpState::Connected {
            return make_error_msg(
                QpCode::INVALID_STATE,
                format!("queue pair {} is {}", self.qpn, self.state),
            );
        }
        Ok(qp)
    }

    fn local_sge(&self, addr: u64, length: u32) -> Result<Sge> {
        let local = match self.local {
            Some(local) if local.local_token != 0 => local,
            _ => return make_error_msg(QpCode::UNBOUND_MEMORY, "no local memory bound"),
        };
        if !local.contains(addr, length as u64) {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                format!(
                    "{addr:#x}+{length} outside local region {:#x}+{}",
                    local.address, local.length
                ),
            );
        }
        Ok(Sge {
            addr,
            length,
            lkey: local.local_token,
        })
    }

    /// Submit one operation. Returns once the send queue has accepted it; a
    /// signaled operation later yields exactly one completion.
    pub fn post(&self, work: &WorkDescriptor, addr: &AddressDescriptor) -> Result<()> {
        let qp = self.check_connected()?;
        let sge = self.local_sge(addr.local_addr, work.length)?;

        let (opcode, remote) = match work.kind {
            WorkKind::Send => {
                let opcode = match addr.imm {
                    Some(imm) => SendOpcode::SendWithImm(imm),
                    None => SendOpcode::Send,
                };
                (opcode, None)
            }
            WorkKind::Read | WorkKind::Write => {
                let remote = match self.remote {
                    Some(remote) if remote.is_accessible() => remote,
                    _ => return make_error_msg(QpCode::UNBOUND_MEMORY, "no remote memory bound"),
                };
                let Some(target) = remote.base_address.checked_add(addr.remote_offset) else {
                    return make_error_msg(StatusCode::INVALID_ARG, "remote offset overflows");
                };
                let opcode = match (work.kind, addr.imm) {
                    (WorkKind::Read, None) => SendOpcode::RdmaRead,
                    (WorkKind::Read, Some(_)) => {
                        return make_error_msg(StatusCode::INVALID_ARG, "reads carry no immediate data")
                    }
                    (_, Some(imm)) => SendOpcode::RdmaWriteWithImm(imm),
                    (_, None) => SendOpcode::RdmaWrite,
                };
                let target = RemoteTarget {
                    addr: target,
                    rkey: remote.remote_token,
                };
                (opcode, Some(target))
            }
        };

        let wr = SendRequest {
            wr_id: work.wr_id,
            opcode,
            signaled: work.signaled,
            sge,
            remote,
        };
        qp.post_send(&wr).map_err(|e| match e {
            DriverError::QueueFull => Status::with_message(StatusCode::QUEUE_FULL, "send queue full"),
            other => Status::with_message(QpCode::TRANSPORT_ERROR, other.to_string()),
        })
    }

    /// Post a receive buffer inside the bound local region for an incoming
    /// send.
    pub fn post_recv(&self, wr_id: u64, local_addr: u64, length: u32) -> Result<()> {
        let qp = self.check_connected()?;
        let sge = self.local_sge(local_addr, length)?;
        qp.post_recv(&RecvRequest { wr_id, sge }).map_err(|e| match e {
            DriverError::QueueFull => Status::with_message(StatusCode::QUEUE_FULL, "receive queue full"),
            other => Status::with_message(QpCode::TRANSPORT_ERROR, other.to_string()),
        })
    }

    /// Drain up to `max` completions without blocking.
    pub fn poll_completions(&self, max: usize) -> Result<Vec<WorkCompletion>> {
        let Some(cq) = &self.cq else {
            return make_error_msg(QpCode::INVALID_STATE, format!("queue pair {} destroyed", self.qpn));
        };
        cq.poll(max)
            .map_err(|e| Status::with_message(QpCode::TRANSPORT_ERROR, e.to_string()))
    }

    /// Release the queue pair and its completion queue.
    pub fn destroy(&mut self) {
        if self.state == QpState::Destroyed {
            return;
        }
        self.qp = None;
        self.cq = None;
        self.state = QpState::Destroyed;
        tracing::debug!(qpn = %self.qpn, "queue pair destroyed");
    }
}

impl fmt::Debug for ReliableConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableConnection")
            .field("device", &self.device.name())
            .field("qpn", &self.qpn)
            .field("state", &self.state)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}
