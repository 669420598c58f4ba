//! A software RDMA fabric.
//!
//! `SoftDriver` implements [`Driver`] entirely in process: every device it
//! exposes sits on one shared fabric, queue pairs on any of them can be
//! connected to each other (or to themselves), and one-sided operations copy
//! bytes directly between registered regions. It enforces the rules real
//! hardware enforces: the queue-pair state machine, key, bounds and access
//! checks, bounded queues, and error completions that move a queue pair to
//! the error state and flush whatever is posted after.
//!
//! Work executes synchronously inside `post_send`; its completion is already
//! queued when the call returns.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::access::Access;
use crate::device::{LinkLayer, PortState};
use crate::driver::{
    CompletionOpcode, CompletionStatus, Driver, DriverError, DriverResult, HwQpState, MrInfo,
    PortAttr, QpCaps, QpInfo, QpTransition, RawContext, RawCq, RawMr, RawPd, RawQp, RecvRequest,
    SendOpcode, SendRequest, WorkCompletion,
};

const VALID_MTUS: [u32; 5] = [256, 512, 1024, 2048, 4096];

/// Static description of one emulated device.
#[derive(Debug, Clone)]
pub struct SoftDeviceSpec {
    name: String,
    link_layer: LinkLayer,
    ports: Vec<(u8, PortState)>,
    max_mr_size: usize,
    max_qp_wr: u32,
    max_cqe: u32,
}

impl SoftDeviceSpec {
    /// An InfiniBand device with one active port, numbered 1.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            link_layer: LinkLayer::Infiniband,
            ports: vec![(1, PortState::Active)],
            max_mr_size: 1 << 30,
            max_qp_wr: 4096,
            max_cqe: 1 << 16,
        }
    }

    pub fn link_layer(mut self, link_layer: LinkLayer) -> Self {
        self.link_layer = link_layer;
        self
    }

    /// Set the state of `port`, adding the port if it does not exist yet.
    pub fn port_state(mut self, port: u8, state: PortState) -> Self {
        match self.ports.iter_mut().find(|(num, _)| *num == port) {
            Some(entry) => entry.1 = state,
            None => self.ports.push((port, state)),
        }
        self
    }

    /// Largest region `reg_mr` will pin; bigger requests fail.
    pub fn max_mr_size(mut self, bytes: usize) -> Self {
        self.max_mr_size = bytes;
        self
    }

    pub fn max_qp_wr(mut self, wr: u32) -> Self {
        self.max_qp_wr = wr;
        self
    }
}

/// Live object counts, for leak checks in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub contexts: usize,
    pub pds: usize,
    pub mrs: usize,
    pub cqs: usize,
    pub qps: usize,
    /// Releases of handles that were not live (double free or garbage).
    pub invalid_releases: usize,
}

struct SoftMr {
    pd: u64,
    addr: u64,
    len: usize,
    access: Access,
    lkey: u32,
    rkey: u32,
}

struct SoftCq {
    ctx: u64,
    capacity: usize,
    entries: VecDeque<WorkCompletion>,
}

struct SoftQp {
    ctx: u64,
    pd: u64,
    cq: u64,
    qpn: u32,
    caps: QpCaps,
    state: HwQpState,
    access: Access,
    peer: Option<u32>,
    recv_queue: VecDeque<RecvRequest>,
    /// Signaled sends whose completion has not been polled yet.
    sq_inflight: u32,
}

#[derive(Default)]
struct Fabric {
    devices: Vec<SoftDeviceSpec>,
    next_handle: u64,
    next_key: u32,
    next_qpn: u32,
    contexts: HashMap<u64, usize>,
    pds: HashMap<u64, u64>,
    mrs: HashMap<u64, SoftMr>,
    keys: HashMap<u32, u64>,
    cqs: HashMap<u64, SoftCq>,
    qps: HashMap<u64, SoftQp>,
    qpns: HashMap<u32, u64>,
    invalid_releases: usize,
}

/// Where a memory check failed, which decides the completion status.
#[derive(Clone, Copy)]
enum Side {
    Local,
    Remote,
}

impl Side {
    fn fault(self) -> CompletionStatus {
        match self {
            Side::Local => CompletionStatus::LocalProtectionError,
            Side::Remote => CompletionStatus::RemoteAccessError,
        }
    }
}

impl Fabric {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn port_attr(&self, device: usize, port: u8) -> Option<PortAttr> {
        let spec = self.devices.get(device)?;
        let (_, state) = spec.ports.iter().find(|(num, _)| *num == port)?;
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[14] = device as u8;
        gid[15] = port;
        Some(PortAttr {
            state: *state,
            link_layer: spec.link_layer,
            lid: 1 + (device as u16) * 16 + port as u16,
            gid,
        })
    }

    fn device_of(&self, ctx: u64) -> DriverResult<usize> {
        self.contexts
            .get(&ctx)
            .copied()
            .ok_or(DriverError::InvalidHandle {
                kind: "context",
                handle: ctx,
            })
    }

    /// Check that `[addr, addr + len)` is covered by the region behind `key`
    /// in protection domain `pd` with `needed` access.
    fn check_mr(
        &self,
        key: u32,
        pd: u64,
        addr: u64,
        len: u32,
        needed: Access,
        side: Side,
    ) -> Result<(), CompletionStatus> {
        let mr = self
            .keys
            .get(&key)
            .and_then(|h| self.mrs.get(h))
            .ok_or(side.fault())?;
        let key_matches = match side {
            Side::Local => mr.lkey == key,
            Side::Remote => mr.rkey == key,
        };
        let end = addr.checked_add(len as u64).ok_or(side.fault())?;
        let in_bounds = addr >= mr.addr && end <= mr.addr + mr.len as u64;
        if !key_matches || mr.pd != pd || !in_bounds || !mr.access.contains(needed) {
            return Err(side.fault());
        }
        Ok(())
    }

    fn push_completion(&mut self, cq: u64, wc: WorkCompletion) {
        match self.cqs.get_mut(&cq) {
            Some(cq) if cq.entries.len() < cq.capacity => cq.entries.push_back(wc),
            Some(_) => tracing::warn!(qpn = wc.qpn, wr_id = wc.wr_id, "completion queue overrun"),
            None => {}
        }
    }

    fn cq_has_room(&self, cq: u64) -> bool {
        self.cqs
            .get(&cq)
            .map_or(false, |cq| cq.entries.len() < cq.capacity)
    }

    /// Execute one send-queue work request against its peer. Returns the
    /// completion status and the number of bytes moved.
    fn execute(&mut self, local_pd: u64, peer_qpn: Option<u32>, wr: &SendRequest) -> (CompletionStatus, u32) {
        let len = wr.sge.length;
        let local_needed = match wr.opcode {
            SendOpcode::RdmaRead => Access::LOCAL_WRITE,
            _ => Access::empty(),
        };
        if let Err(status) = self.check_mr(wr.sge.lkey, local_pd, wr.sge.addr, len, local_needed, Side::Local) {
            return (status, 0);
        }

        let peer = peer_qpn
            .and_then(|qpn| self.qpns.get(&qpn).copied())
            .and_then(|h| self.qps.get(&h).map(|qp| (h, qp.pd, qp.cq, qp.qpn, qp.state, qp.access)));
        let Some((peer_handle, peer_pd, peer_cq, peer_qpn, peer_state, peer_access)) = peer else {
            return (CompletionStatus::RetryExceeded, 0);
        };
        if !matches!(peer_state, HwQpState::ReadyToReceive | HwQpState::ReadyToSend) {
            return (CompletionStatus::RetryExceeded, 0);
        }

        // One-sided data movement.
        if wr.opcode.is_rdma() {
            let Some(remote) = wr.remote else {
                return (CompletionStatus::RemoteInvalidRequest, 0);
            };
            let needed = match wr.opcode {
                SendOpcode::RdmaRead => Access::REMOTE_READ,
                _ => Access::REMOTE_WRITE,
            };
            if !peer_access.contains(needed) {
                return (CompletionStatus::RemoteAccessError, 0);
            }
            if let Err(status) = self.check_mr(remote.rkey, peer_pd, remote.addr, len, needed, Side::Remote) {
                return (status, 0);
            }
            let (src, dst) = match wr.opcode {
                SendOpcode::RdmaRead => (remote.addr, wr.sge.addr),
                _ => (wr.sge.addr, remote.addr),
            };
            // SAFETY: both ranges were just checked to lie inside live
            // registrations, whose owners guarantee the memory stays valid
            // until deregistration. `copy` tolerates overlap (loopback).
            unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len as usize) };
            if matches!(wr.opcode, SendOpcode::RdmaRead | SendOpcode::RdmaWrite) {
                return (CompletionStatus::Success, len);
            }
        }

        // Everything else consumes a receive on the peer.
        let recv = self
            .qps
            .get_mut(&peer_handle)
            .and_then(|qp| qp.recv_queue.pop_front());
        let Some(recv) = recv else {
            return (CompletionStatus::RnrRetryExceeded, 0);
        };

        let (opcode, copied) = match wr.opcode {
            SendOpcode::RdmaWriteWithImm(_) => (CompletionOpcode::RecvRdmaWithImm, len),
            _ => {
                if recv.sge.length < len {
                    let wc = WorkCompletion {
                        wr_id: recv.wr_id,
                        status: CompletionStatus::LocalLengthError,
                        opcode: CompletionOpcode::Recv,
                        byte_len: 0,
                        imm: None,
                        qpn: peer_qpn,
                    };
                    self.push_completion(peer_cq, wc);
                    self.set_state(peer_handle, HwQpState::Error);
                    return (CompletionStatus::RemoteInvalidRequest, 0);
                }
                if self
                    .check_mr(recv.sge.lkey, peer_pd, recv.sge.addr, len, Access::LOCAL_WRITE, Side::Local)
                    .is_err()
                {
                    return (CompletionStatus::RemoteAccessError, 0);
                }
                // SAFETY: as above; the receive buffer was checked against its
                // registration.
                unsafe {
                    std::ptr::copy(wr.sge.addr as *const u8, recv.sge.addr as *mut u8, len as usize)
                };
                (CompletionOpcode::Recv, len)
            }
        };

        let wc = WorkCompletion {
            wr_id: recv.wr_id,
            status: CompletionStatus::Success,
            opcode,
            byte_len: copied,
            imm: wr.opcode.imm(),
            qpn: peer_qpn,
        };
        self.push_completion(peer_cq, wc);
        (CompletionStatus::Success, len)
    }

    fn set_state(&mut self, qp: u64, state: HwQpState) {
        if let Some(qp) = self.qps.get_mut(&qp) {
            qp.state = state;
        }
    }

    fn release<V>(map: &mut HashMap<u64, V>, handle: u64, kind: &str, invalid: &mut usize) -> Option<V> {
        let removed = map.remove(&handle);
        if removed.is_none() {
            *invalid += 1;
            tracing::warn!(kind, handle, "release of a handle that is not live");
        }
        removed
    }
}

/// The software fabric. Construct with [`SoftDriver::new`] and hand it out as
/// an `Arc<dyn Driver>`.
pub struct SoftDriver {
    fabric: Mutex<Fabric>,
}

impl SoftDriver {
    pub fn new(devices: Vec<SoftDeviceSpec>) -> Arc<Self> {
        Arc::new(Self {
            fabric: Mutex::new(Fabric {
                devices,
                next_key: 0x100,
                next_qpn: 0x10,
                ..Fabric::default()
            }),
        })
    }

    /// One InfiniBand device named `name` with an active port 1.
    pub fn single(name: &str) -> Arc<Self> {
        Self::new(vec![SoftDeviceSpec::new(name)])
    }

    /// Change a port's state. Devices opened afterwards observe it.
    pub fn set_port_state(&self, device: &str, port: u8, state: PortState) -> bool {
        let mut fabric = self.fabric.lock();
        let Some(spec) = fabric.devices.iter_mut().find(|d| d.name == device) else {
            return false;
        };
        match spec.ports.iter_mut().find(|(num, _)| *num == port) {
            Some(entry) => {
                entry.1 = state;
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SoftStats {
        let fabric = self.fabric.lock();
        SoftStats {
            contexts: fabric.contexts.len(),
            pds: fabric.pds.len(),
            mrs: fabric.mrs.len(),
            cqs: fabric.cqs.len(),
            qps: fabric.qps.len(),
            invalid_releases: fabric.invalid_releases,
        }
    }

    /// Hardware state of the queue pair numbered `qpn`, if it exists.
    pub fn qp_state(&self, qpn: u32) -> Option<HwQpState> {
        let fabric = self.fabric.lock();
        let handle = fabric.qpns.get(&qpn)?;
        fabric.qps.get(handle).map(|qp| qp.state)
    }
}

impl Driver for SoftDriver {
    fn name(&self) -> &str {
        "soft"
    }

    fn device_names(&self) -> Vec<String> {
        self.fabric.lock().devices.iter().map(|d| d.name.clone()).collect()
    }

    fn open_context(&self, device: &str) -> DriverResult<RawContext> {
        let mut fabric = self.fabric.lock();
        let idx = fabric
            .devices
            .iter()
            .position(|d| d.name == device)
            .ok_or_else(|| DriverError::NoSuchDevice(device.to_string()))?;
        let handle = fabric.handle();
        fabric.contexts.insert(handle, idx);
        Ok(RawContext(handle))
    }

    fn close_context(&self, ctx: RawContext) {
        let mut fabric = self.fabric.lock();
        let fabric = &mut *fabric;
        Fabric::release(&mut fabric.contexts, ctx.0, "context", &mut fabric.invalid_releases);
    }

    fn query_port(&self, ctx: RawContext, port: u8) -> DriverResult<PortAttr> {
        let fabric = self.fabric.lock();
        let device = fabric.device_of(ctx.0)?;
        fabric
            .port_attr(device, port)
            .ok_or(DriverError::NoSuchPort { context: ctx.0, port })
    }

    fn alloc_pd(&self, ctx: RawContext) -> DriverResult<RawPd> {
        let mut fabric = self.fabric.lock();
        fabric.device_of(ctx.0)?;
        let handle = fabric.handle();
        fabric.pds.insert(handle, ctx.0);
        Ok(RawPd(handle))
    }

    fn dealloc_pd(&self, pd: RawPd) {
        let mut fabric = self.fabric.lock();
        let fabric = &mut *fabric;
        Fabric::release(&mut fabric.pds, pd.0, "pd", &mut fabric.invalid_releases);
    }

    unsafe fn reg_mr(&self, pd: RawPd, addr: u64, len: usize, access: Access) -> DriverResult<MrInfo> {
        let mut fabric = self.fabric.lock();
        let ctx = *fabric.pds.get(&pd.0).ok_or(DriverError::InvalidHandle {
            kind: "pd",
            handle: pd.0,
        })?;
        let device = fabric.device_of(ctx)?;
        if addr == 0 || len == 0 {
            return Err(DriverError::InvalidArgument(format!("region {addr:#x}+{len}")));
        }
        if addr.checked_add(len as u64).is_none() {
            return Err(DriverError::InvalidArgument("region wraps the address space".into()));
        }
        if access.intersects(Access::REMOTE_WRITE | Access::REMOTE_ATOMIC)
            && !access.contains(Access::LOCAL_WRITE)
        {
            return Err(DriverError::InvalidArgument(
                "remote write or atomic access requires local write".into(),
            ));
        }
        if len > fabric.devices[device].max_mr_size {
            return Err(DriverError::Exhausted("pinnable memory"));
        }

        let handle = fabric.handle();
        let lkey = fabric.next_key;
        let rkey = lkey + 1;
        fabric.next_key += 2;
        fabric.keys.insert(lkey, handle);
        fabric.keys.insert(rkey, handle);
        fabric.mrs.insert(
            handle,
            SoftMr {
                pd: pd.0,
                addr,
                len,
                access,
                lkey,
                rkey,
            },
        );
        Ok(MrInfo {
            handle: RawMr(handle),
            lkey,
            rkey,
        })
    }

    fn dereg_mr(&self, mr: RawMr) {
        let mut fabric = self.fabric.lock();
        let fabric = &mut *fabric;
        if let Some(mr) = Fabric::release(&mut fabric.mrs, mr.0, "mr", &mut fabric.invalid_releases) {
            fabric.keys.remove(&mr.lkey);
            fabric.keys.remove(&mr.rkey);
        }
    }

    fn create_cq(&self, ctx: RawContext, entries: u32) -> DriverResult<RawCq> {
        let mut fabric = self.fabric.lock();
        let device = fabric.device_of(ctx.0)?;
        if entries == 0 {
            return Err(DriverError::InvalidArgument("zero-entry completion queue".into()));
        }
        if entries > fabric.devices[device].max_cqe {
            return Err(DriverError::Exhausted("completion queue entries"));
        }
        let handle = fabric.handle();
        fabric.cqs.insert(
            handle,
            SoftCq {
                ctx: ctx.0,
                capacity: entries as usize,
                entries: VecDeque::new(),
            },
        );
        Ok(RawCq(handle))
    }

    fn destroy_cq(&self, cq: RawCq) {
        let mut fabric = self.fabric.lock();
        let fabric = &mut *fabric;
        Fabric::release(&mut fabric.cqs, cq.0, "cq", &mut fabric.invalid_releases);
    }

    fn poll_cq(&self, cq: RawCq, max: usize) -> DriverResult<Vec<WorkCompletion>> {
        let mut fabric = self.fabric.lock();
        let queue = fabric.cqs.get_mut(&cq.0).ok_or(DriverError::InvalidHandle {
            kind: "cq",
            handle: cq.0,
        })?;
        let n = max.min(queue.entries.len());
        let polled: Vec<WorkCompletion> = queue.entries.drain(..n).collect();

        // Polling a send completion frees its send-queue slot.
        for wc in &polled {
            if matches!(wc.opcode, CompletionOpcode::Recv | CompletionOpcode::RecvRdmaWithImm) {
                continue;
            }
            if let Some(handle) = fabric.qpns.get(&wc.qpn).copied() {
                if let Some(qp) = fabric.qps.get_mut(&handle) {
                    qp.sq_inflight = qp.sq_inflight.saturating_sub(1);
                }
            }
        }
        Ok(polled)
    }

    fn create_qp(&self, pd: RawPd, cq: RawCq, caps: QpCaps) -> DriverResult<QpInfo> {
        let mut fabric = self.fabric.lock();
        let ctx = *fabric.pds.get(&pd.0).ok_or(DriverError::InvalidHandle {
            kind: "pd",
            handle: pd.0,
        })?;
        let cq_ctx = fabric
            .cqs
            .get(&cq.0)
            .map(|cq| cq.ctx)
            .ok_or(DriverError::InvalidHandle {
                kind: "cq",
                handle: cq.0,
            })?;
        if cq_ctx != ctx {
            return Err(DriverError::InvalidArgument(
                "completion queue belongs to another context".into(),
            ));
        }
        if caps.max_send_wr == 0 || caps.max_recv_wr == 0 || caps.max_sge == 0 {
            return Err(DriverError::InvalidArgument(format!("queue pair caps {caps:?}")));
        }
        let device = fabric.device_of(ctx)?;
        let limit = fabric.devices[device].max_qp_wr;
        if caps.max_send_wr > limit || caps.max_recv_wr > limit {
            return Err(DriverError::Exhausted("work requests"));
        }

        let handle = fabric.handle();
        let qpn = fabric.next_qpn;
        fabric.next_qpn += 1;
        fabric.qpns.insert(qpn, handle);
        fabric.qps.insert(
            handle,
            SoftQp {
                ctx,
                pd: pd.0,
                cq: cq.0,
                qpn,
                caps,
                state: HwQpState::Reset,
                access: Access::empty(),
                peer: None,
                recv_queue: VecDeque::new(),
                sq_inflight: 0,
            },
        );
        Ok(QpInfo {
            handle: RawQp(handle),
            qpn,
        })
    }

    fn modify_qp(&self, qp: RawQp, transition: QpTransition) -> DriverResult<()> {
        let mut fabric = self.fabric.lock();
        let (ctx, qpn, from) = fabric
            .qps
            .get(&qp.0)
            .map(|q| (q.ctx, q.qpn, q.state))
            .ok_or(DriverError::InvalidHandle {
                kind: "qp",
                handle: qp.0,
            })?;
        let to = transition.target();
        let allowed = matches!(
            (from, to),
            (_, HwQpState::Reset)
                | (HwQpState::Reset, HwQpState::Init)
                | (HwQpState::Init, HwQpState::ReadyToReceive)
                | (HwQpState::ReadyToReceive, HwQpState::ReadyToSend)
        );
        if !allowed {
            return Err(DriverError::InvalidTransition { qpn, from, to });
        }

        let mut peer = None;
        let mut access = None;
        match transition {
            QpTransition::Reset | QpTransition::ReadyToSend { .. } => {}
            QpTransition::Init {
                port,
                access: init_access,
                ..
            } => {
                let device = fabric.device_of(ctx)?;
                let attr = fabric
                    .port_attr(device, port)
                    .ok_or(DriverError::NoSuchPort { context: ctx, port })?;
                if attr.state != PortState::Active {
                    return Err(DriverError::PortNotActive(port));
                }
                access = Some(init_access);
            }
            QpTransition::ReadyToReceive { peer: path, path_mtu, .. } => {
                if !VALID_MTUS.contains(&path_mtu) {
                    return Err(DriverError::InvalidArgument(format!("path mtu {path_mtu}")));
                }
                // The path must name a live queue pair at the given address.
                let remote = fabric
                    .qpns
                    .get(&path.qpn)
                    .and_then(|h| fabric.qps.get(h))
                    .ok_or(DriverError::PeerUnreachable(path.qpn))?;
                let remote_device = fabric.device_of(remote.ctx)?;
                let reachable = fabric.devices[remote_device].ports.iter().any(|(num, _)| {
                    fabric.port_attr(remote_device, *num).map_or(false, |attr| match attr.link_layer {
                        LinkLayer::Infiniband => attr.lid == path.lid,
                        LinkLayer::Ethernet => attr.gid == path.gid,
                    })
                });
                if !reachable {
                    return Err(DriverError::PeerUnreachable(path.qpn));
                }
                peer = Some(path.qpn);
            }
        }

        let Some(q) = fabric.qps.get_mut(&qp.0) else {
            return Err(DriverError::InvalidHandle {
                kind: "qp",
                handle: qp.0,
            });
        };
        q.state = to;
        match to {
            HwQpState::Reset => {
                q.peer = None;
                q.access = Access::empty();
                q.recv_queue.clear();
                q.sq_inflight = 0;
            }
            HwQpState::Init => q.access = access.unwrap_or(Access::empty()),
            HwQpState::ReadyToReceive => q.peer = peer,
            HwQpState::ReadyToSend | HwQpState::Error => {}
        }
        Ok(())
    }

    fn destroy_qp(&self, qp: RawQp) {
        let mut fabric = self.fabric.lock();
        let fabric = &mut *fabric;
        if let Some(qp) = Fabric::release(&mut fabric.qps, qp.0, "qp", &mut fabric.invalid_releases) {
            fabric.qpns.remove(&qp.qpn);
        }
    }

    fn post_send(&self, qp: RawQp, wr: &SendRequest) -> DriverResult<()> {
        let mut fabric = self.fabric.lock();
        let (pd, cq, qpn, state, peer, inflight, max_send) = fabric
            .qps
            .get(&qp.0)
            .map(|q| (q.pd, q.cq, q.qpn, q.state, q.peer, q.sq_inflight, q.caps.max_send_wr))
            .ok_or(DriverError::InvalidHandle {
                kind: "qp",
                handle: qp.0,
            })?;

        let opcode = match wr.opcode {
            SendOpcode::Send | SendOpcode::SendWithImm(_) => CompletionOpcode::Send,
            SendOpcode::RdmaWrite | SendOpcode::RdmaWriteWithImm(_) => CompletionOpcode::RdmaWrite,
            SendOpcode::RdmaRead => CompletionOpcode::RdmaRead,
        };
        let completion = |status, byte_len| WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode,
            byte_len,
            imm: None,
            qpn,
        };

        match state {
            HwQpState::Error => {
                fabric.push_completion(cq, completion(CompletionStatus::Flushed, 0));
                return Ok(());
            }
            HwQpState::ReadyToSend => {}
            other => return Err(DriverError::NotReady { qpn, state: other }),
        }
        if wr.opcode.is_rdma() && wr.remote.is_none() {
            return Err(DriverError::InvalidArgument("RDMA operation without a remote target".into()));
        }
        if inflight >= max_send || !fabric.cq_has_room(cq) {
            return Err(DriverError::QueueFull);
        }

        let (status, byte_len) = fabric.execute(pd, peer, wr);
        if status == CompletionStatus::Success {
            if wr.signaled {
                fabric.push_completion(cq, completion(status, byte_len));
                if let Some(q) = fabric.qps.get_mut(&qp.0) {
                    q.sq_inflight += 1;
                }
            }
        } else {
            tracing::debug!(qpn, wr_id = wr.wr_id, ?status, "work request failed");
            // Errors complete even when unsignaled.
            fabric.push_completion(cq, completion(status, 0));
            fabric.set_state(qp.0, HwQpState::Error);
        }
        Ok(())
    }

    fn post_recv(&self, qp: RawQp, wr: &RecvRequest) -> DriverResult<()> {
        let mut fabric = self.fabric.lock();
        let (cq, qpn, state, queued, max_recv) = fabric
            .qps
            .get(&qp.0)
            .map(|q| (q.cq, q.qpn, q.state, q.recv_queue.len(), q.caps.max_recv_wr))
            .ok_or(DriverError::InvalidHandle {
                kind: "qp",
                handle: qp.0,
            })?;
        match state {
            HwQpState::Reset => return Err(DriverError::NotReady { qpn, state }),
            HwQpState::Error => {
                let wc = WorkCompletion {
                    wr_id: wr.wr_id,
                    status: CompletionStatus::Flushed,
                    opcode: CompletionOpcode::Recv,
                    byte_len: 0,
                    imm: None,
                    qpn,
                };
                fabric.push_completion(cq, wc);
                return Ok(());
            }
            _ => {}
        }
        if queued >= max_recv as usize {
            return Err(DriverError::QueueFull);
        }
        if let Some(q) = fabric.qps.get_mut(&qp.0) {
            q.recv_queue.push_back(*wr);
        }
        Ok(())
    }
}
