//! Fixed wire schema, written in the sender's native byte order and read back in whichever
//! order the endian marker announces.

use super::*;

use crate::constants::{MAX_FORM_RINGS, MAX_PROCS_RING, MAX_REPS, MAX_SEQ_GAP, MAX_TOKEN_BODY};
use crate::proc_id::ProcId;

use byteorder::{BigEndian, ByteOrder, LittleEndian, NativeEndian};
use bytes::{Bytes, BytesMut};

use std::marker::PhantomData;

pub const PACKET_HEADER_SIZE: usize = 36;
pub const TOKEN_HEADER_SIZE: usize = 40;

// Set in every type word. Read in the wrong byte order it shows up as `ENDIAN_MIRROR`, which
// is never set by an encoder.
const ENDIAN_MARK: u32 = 0x8000_0000;
const ENDIAN_MIRROR: u32 = 0x0000_0080;

const UNRELIABLE: u32 = 0x0000_0001;
const RELIABLE: u32 = 0x0000_0002;
const FIFO: u32 = 0x0000_0004;
const CAUSAL: u32 = 0x0000_0008;
const AGREED: u32 = 0x0000_0010;
const SAFE: u32 = 0x0000_0020;
const SERVICE_MASK: u32 = 0x0000_003f;
const ALIVE: u32 = 0x0000_0100;
const JOIN: u32 = 0x0000_0200;
const REFER: u32 = 0x0000_0400;
const HURRY: u32 = 0x0000_1000;
const MEMBERSHIP_MASK: u32 = ALIVE | JOIN | REFER | HURRY;
const ROUTED: u32 = 0x0000_2000;

const ARQ_MASK: u32 = 0x0000_000f;
const RETRANS_MASK: u32 = 0x0000_0f00;
const RETRANS_SHIFT: u32 = 8;
const FORM1: u32 = 0x0001_0000;
const FORM2: u32 = 0x0002_0000;

const NO_PROC: u32 = u32::MAX;
const NO_SEGMENT: u16 = u16::MAX;

const MEMBER_LIST_FIXED: usize = 4;
const REP_SIZE: usize = 8;
const RING_INFO_FIXED: usize = 28;
/// Encoded size of a retransmission request without its sequence numbers.
pub const RING_RTR_FIXED: usize = 16;

/// Byte order a datagram was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A decoded unit together with the configuration hash it was stamped with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamped<T> {
    pub conf_hash: u32,
    pub endian: Endian,
    pub inner: T,
}

fn service_bit(service: Service) -> u32 {
    match service {
        Service::Unreliable => UNRELIABLE,
        Service::Reliable => RELIABLE,
        Service::Fifo => FIFO,
        Service::Causal => CAUSAL,
        Service::Agreed => AGREED,
        Service::Safe => SAFE,
    }
}

fn service_from_bits(bits: u32) -> Option<Service> {
    match bits {
        UNRELIABLE => Some(Service::Unreliable),
        RELIABLE => Some(Service::Reliable),
        FIFO => Some(Service::Fifo),
        CAUSAL => Some(Service::Causal),
        AGREED => Some(Service::Agreed),
        SAFE => Some(Service::Safe),
        _ => None,
    }
}

pub fn member_list_len(members: &MemberList) -> usize {
    MEMBER_LIST_FIXED + 4 * members.ids.len()
}

pub fn rep_list_len(reps: &RepList) -> usize {
    4 + REP_SIZE * reps.reps.len()
}

pub fn ring_info_len(info: &RingInfo) -> usize {
    RING_INFO_FIXED + 4 * info.holes.len() + 4 * info.commit.len()
}

pub fn ring_rtr_len(rtr: &RingRtr) -> usize {
    RING_RTR_FIXED + 4 * rtr.seqs.len()
}

pub fn body_len(body: &Body) -> usize {
    match body {
        Body::Data { bytes, .. } => bytes.len(),
        Body::Alive(members) => member_list_len(members),
        Body::Join { members, reps } => member_list_len(members) + rep_list_len(reps),
        Body::Refer(_) => REP_SIZE,
        Body::Hurry => 0,
    }
}

/// Bytes the packet occupies inside a datagram, padding included.
pub fn packed_len(packet: &Packet) -> usize {
    let len = PACKET_HEADER_SIZE + body_len(&packet.body);
    (len + 3) & !3
}

pub fn token_body_len(body: &TokenBody) -> usize {
    match body {
        TokenBody::Regular(rtr) => rtr.iter().map(ring_rtr_len).sum(),
        TokenBody::Form1(form) => {
            member_list_len(&form.members)
                + rep_list_len(&form.reps)
                + 4
                + form.rings.iter().map(ring_info_len).sum::<usize>()
        }
        TokenBody::Form2(form) => {
            member_list_len(&form.members) + 8 + 4 + form.rings.iter().map(ring_info_len).sum::<usize>()
        }
    }
}

pub fn encode_datagram(packets: &[Packet], conf_hash: u32) -> Result<Bytes> {
    encode_datagram_with::<NativeEndian>(packets, conf_hash)
}

/// Encodes one or more packets into a single datagram in byte order `B`.
pub fn encode_datagram_with<B: ByteOrder>(packets: &[Packet], conf_hash: u32) -> Result<Bytes> {
    let mut w = Writer::<B>::new();
    for packet in packets {
        w.packet(packet, conf_hash)?;
    }
    Ok(w.freeze())
}

pub fn decode_datagram(buf: &[u8]) -> Result<Stamped<Vec<Packet>>> {
    match detect(buf)? {
        Endian::Little => decode_datagram_with::<LittleEndian>(buf, Endian::Little),
        Endian::Big => decode_datagram_with::<BigEndian>(buf, Endian::Big),
    }
}

pub fn encode_token(token: &Token, conf_hash: u32) -> Result<Bytes> {
    encode_token_with::<NativeEndian>(token, conf_hash)
}

pub fn encode_token_with<B: ByteOrder>(token: &Token, conf_hash: u32) -> Result<Bytes> {
    let body_len = token_body_len(&token.body);
    if body_len > MAX_TOKEN_BODY {
        return Err(Error::TooLarge(body_len));
    }
    let h = &token.header;
    let kind = match token.body {
        TokenBody::Regular(_) => 0,
        TokenBody::Form1(_) => FORM1,
        TokenBody::Form2(_) => FORM2,
    };
    let retrans = (h.retrans.min(MAX_RETRANS) as u32) << RETRANS_SHIFT;
    let arq = (h.arq % ARQ_MODULUS) as u32;

    let mut w = Writer::<B>::new();
    w.u32(ENDIAN_MARK | kind | retrans | arq);
    w.proc_id(h.transmitter);
    w.u32(h.seq);
    w.proc_id(h.proc_id);
    w.memb_id(h.memb_id);
    w.u32(h.aru);
    w.opt_proc(h.aru_last_id);
    w.i16(h.flow_control);
    w.u16(body_len as u16);
    w.u32(conf_hash);
    match &token.body {
        TokenBody::Regular(rtr) => {
            for r in rtr {
                w.rtr(r)?;
            }
        }
        TokenBody::Form1(form) => {
            w.members(&form.members)?;
            w.reps(&form.reps)?;
            w.rings(&form.rings)?;
        }
        TokenBody::Form2(form) => {
            w.members(&form.members)?;
            w.memb_id(form.memb_id);
            w.rings(&form.rings)?;
        }
    }
    Ok(w.freeze())
}

pub fn decode_token(buf: &[u8]) -> Result<Stamped<Token>> {
    match detect(buf)? {
        Endian::Little => decode_token_with::<LittleEndian>(buf, Endian::Little),
        Endian::Big => decode_token_with::<BigEndian>(buf, Endian::Big),
    }
}

fn detect(buf: &[u8]) -> Result<Endian> {
    if buf.len() < 4 {
        return Err(Error::Truncated { needed: 4, available: buf.len() });
    }
    let le = LittleEndian::read_u32(&buf[..4]);
    if le & ENDIAN_MARK != 0 && le & ENDIAN_MIRROR == 0 {
        return Ok(Endian::Little);
    }
    let be = BigEndian::read_u32(&buf[..4]);
    if be & ENDIAN_MARK != 0 && be & ENDIAN_MIRROR == 0 {
        return Ok(Endian::Big);
    }
    Err(Error::BadEndianMarker(le))
}

fn decode_datagram_with<B: ByteOrder>(buf: &[u8], endian: Endian) -> Result<Stamped<Vec<Packet>>> {
    let mut r = Reader::<B>::new(buf);
    let mut packets = vec![];
    let mut conf_hash = 0;
    while r.remaining() > 0 {
        let (hash, packet) = r.packet()?;
        if packets.is_empty() {
            conf_hash = hash;
        } else if hash != conf_hash {
            return Err(Error::MixedHashes);
        }
        packets.push(packet);
        r.align4();
    }
    Ok(Stamped { conf_hash, endian, inner: packets })
}

fn decode_token_with<B: ByteOrder>(buf: &[u8], endian: Endian) -> Result<Stamped<Token>> {
    let mut r = Reader::<B>::new(buf);
    let ty = r.u32()?;
    if ty & !(ENDIAN_MARK | FORM1 | FORM2 | RETRANS_MASK | ARQ_MASK) != 0 {
        return Err(Error::UnknownType(ty));
    }
    let header = TokenHeader {
        transmitter: r.proc_id()?,
        seq: r.u32()?,
        proc_id: r.proc_id()?,
        memb_id: r.memb_id()?,
        aru: r.u32()?,
        aru_last_id: r.opt_proc()?,
        flow_control: r.i16()?,
        arq: (ty & ARQ_MASK) as u8,
        retrans: ((ty & RETRANS_MASK) >> RETRANS_SHIFT) as u8,
    };
    let declared = r.u16()? as usize;
    let conf_hash = r.u32()?;
    if r.remaining() != declared {
        return Err(Error::LengthMismatch { declared, actual: r.remaining() });
    }
    let body_bytes = r.take(declared)?;
    let mut br = Reader::<B>::new(body_bytes);
    let body = match ty & (FORM1 | FORM2) {
        0 => {
            let mut rtr = vec![];
            while br.remaining() > 0 {
                rtr.push(br.rtr()?);
            }
            TokenBody::Regular(rtr)
        }
        FORM1 => {
            let members = br.members()?;
            let reps = br.reps()?;
            let rings = br.rings()?;
            TokenBody::Form1(Form1 { members, reps, rings })
        }
        FORM2 => {
            let members = br.members()?;
            let memb_id = br.memb_id()?;
            let rings = br.rings()?;
            TokenBody::Form2(Form2 { members, memb_id, rings })
        }
        _ => return Err(Error::UnknownType(ty)),
    };
    br.finish()?;
    Ok(Stamped { conf_hash, endian, inner: Token { header, body } })
}

struct Writer<B> {
    buf: BytesMut,
    order: PhantomData<B>,
}

impl<B: ByteOrder> Writer<B> {
    fn new() -> Self {
        Writer { buf: BytesMut::with_capacity(256), order: PhantomData }
    }

    fn u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        B::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    fn i16(&mut self, v: i16) {
        let mut b = [0u8; 2];
        B::write_i16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    fn u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        B::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    fn proc_id(&mut self, id: ProcId) {
        self.u32(id.raw());
    }

    fn opt_proc(&mut self, id: Option<ProcId>) {
        self.u32(id.map(|p| p.raw()).unwrap_or(NO_PROC));
    }

    fn memb_id(&mut self, id: MembershipId) {
        self.proc_id(id.proc_id);
        self.u32(id.time);
    }

    fn pad4(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.extend_from_slice(&[0]);
        }
    }

    fn packet(&mut self, p: &Packet, conf_hash: u32) -> Result<()> {
        let len = body_len(&p.body);
        if len > u16::MAX as usize {
            return Err(Error::TooLarge(len));
        }
        let kind = match &p.body {
            Body::Data { service, .. } => service_bit(*service),
            Body::Alive(_) => ALIVE,
            Body::Join { .. } => JOIN,
            Body::Refer(_) => REFER,
            Body::Hurry => HURRY,
        };
        let routed = if p.header.routed { ROUTED } else { 0 };
        let h = &p.header;
        self.u32(ENDIAN_MARK | kind | routed);
        self.proc_id(h.transmitter);
        self.proc_id(h.proc_id);
        self.memb_id(h.memb_id);
        self.u32(h.seq);
        self.u32(h.token_round);
        self.i16(h.packet_index);
        self.u16(len as u16);
        self.u32(conf_hash);
        match &p.body {
            Body::Data { bytes, .. } => self.buf.extend_from_slice(bytes),
            Body::Alive(members) => self.members(members)?,
            Body::Join { members, reps } => {
                self.members(members)?;
                self.reps(reps)?;
            }
            Body::Refer(rep) => self.rep(rep),
            Body::Hurry => (),
        }
        self.pad4();
        Ok(())
    }

    fn members(&mut self, m: &MemberList) -> Result<()> {
        if m.ids.len() > MAX_PROCS_RING || m.active > m.ids.len() {
            return Err(Error::TooMany { what: "members", count: m.ids.len(), limit: MAX_PROCS_RING });
        }
        self.u16(m.active as u16);
        self.u16(m.num_pending() as u16);
        for id in m.ids.iter() {
            self.proc_id(*id);
        }
        Ok(())
    }

    fn rep(&mut self, rep: &Rep) {
        self.proc_id(rep.proc_id);
        self.u16(rep.kind.to_wire());
        self.u16(rep.seg_index);
    }

    fn reps(&mut self, reps: &RepList) -> Result<()> {
        if reps.reps.len() > MAX_REPS {
            return Err(Error::TooMany { what: "reps", count: reps.reps.len(), limit: MAX_REPS });
        }
        self.u16(reps.reps.len() as u16);
        self.u16(reps.index as u16);
        for rep in reps.reps.iter() {
            self.rep(rep);
        }
        Ok(())
    }

    fn rings(&mut self, rings: &[RingInfo]) -> Result<()> {
        if rings.len() > MAX_FORM_RINGS {
            return Err(Error::TooMany { what: "rings", count: rings.len(), limit: MAX_FORM_RINGS });
        }
        self.u32(rings.len() as u32);
        for info in rings {
            if info.holes.len() > MAX_SEQ_GAP {
                return Err(Error::TooMany { what: "holes", count: info.holes.len(), limit: MAX_SEQ_GAP });
            }
            if info.commit.len() > MAX_PROCS_RING {
                return Err(Error::TooMany {
                    what: "commit",
                    count: info.commit.len(),
                    limit: MAX_PROCS_RING,
                });
            }
            self.memb_id(info.memb_id);
            self.u32(info.trans_time);
            self.u32(info.aru);
            self.u32(info.highest_seq);
            self.u32(info.holes.len() as u32);
            self.u16(info.commit.len() as u16);
            self.u16(info.num_trans as u16);
            for seq in info.holes.iter() {
                self.u32(*seq);
            }
            for id in info.commit.iter() {
                self.proc_id(*id);
            }
        }
        Ok(())
    }

    fn rtr(&mut self, rtr: &RingRtr) -> Result<()> {
        if rtr.seqs.len() > u16::MAX as usize {
            return Err(Error::TooMany { what: "rtr", count: rtr.seqs.len(), limit: u16::MAX as usize });
        }
        self.memb_id(rtr.memb_id);
        self.opt_proc(rtr.proc_id);
        self.u16(rtr.seg_index.unwrap_or(NO_SEGMENT));
        self.u16(rtr.seqs.len() as u16);
        for seq in rtr.seqs.iter() {
            self.u32(*seq);
        }
        Ok(())
    }

    fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

struct Reader<'a, B> {
    buf: &'a [u8],
    pos: usize,
    order: PhantomData<B>,
}

impl<'a, B: ByteOrder> Reader<'a, B> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0, order: PhantomData }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::Truncated { needed: n, available: self.remaining() });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn align4(&mut self) {
        let pad = (4 - self.pos % 4) % 4;
        self.pos += pad.min(self.remaining());
    }

    fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::LengthMismatch { declared: self.pos, actual: self.buf.len() });
        }
        Ok(())
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(B::read_u16(self.take(2)?))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(B::read_i16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(B::read_u32(self.take(4)?))
    }

    fn proc_id(&mut self) -> Result<ProcId> {
        Ok(ProcId::new(self.u32()?))
    }

    fn opt_proc(&mut self) -> Result<Option<ProcId>> {
        let raw = self.u32()?;
        Ok(if raw == NO_PROC { None } else { Some(ProcId::new(raw)) })
    }

    fn memb_id(&mut self) -> Result<MembershipId> {
        let proc_id = self.proc_id()?;
        let time = self.u32()?;
        Ok(MembershipId { proc_id, time })
    }

    fn packet(&mut self) -> Result<(u32, Packet)> {
        self.ensure(PACKET_HEADER_SIZE)?;
        let ty = self.u32()?;
        if ty & ENDIAN_MARK == 0 || ty & ENDIAN_MIRROR != 0 {
            return Err(Error::BadEndianMarker(ty));
        }
        if ty & !(ENDIAN_MARK | SERVICE_MASK | MEMBERSHIP_MASK | ROUTED) != 0 {
            return Err(Error::UnknownType(ty));
        }
        let header = PacketHeader {
            routed: ty & ROUTED != 0,
            transmitter: self.proc_id()?,
            proc_id: self.proc_id()?,
            memb_id: self.memb_id()?,
            seq: self.u32()?,
            token_round: self.u32()?,
            packet_index: self.i16()?,
        };
        let data_len = self.u16()? as usize;
        let conf_hash = self.u32()?;
        let data = self.take(data_len)?;
        let mut br = Reader::<B>::new(data);
        let body = match (ty & MEMBERSHIP_MASK, ty & SERVICE_MASK) {
            (0, bits) => {
                let service = service_from_bits(bits).ok_or(Error::UnknownType(ty))?;
                br.pos = data.len();
                Body::Data { service, bytes: Bytes::copy_from_slice(data) }
            }
            (ALIVE, 0) => Body::Alive(br.members()?),
            (JOIN, 0) => {
                let members = br.members()?;
                let reps = br.reps()?;
                Body::Join { members, reps }
            }
            (REFER, 0) => Body::Refer(br.rep()?),
            (HURRY, 0) => Body::Hurry,
            _ => return Err(Error::UnknownType(ty)),
        };
        br.finish()?;
        Ok((conf_hash, Packet { header, body }))
    }

    fn members(&mut self) -> Result<MemberList> {
        let active = self.u16()? as usize;
        let pending = self.u16()? as usize;
        let total = active + pending;
        if total > MAX_PROCS_RING {
            return Err(Error::TooMany { what: "members", count: total, limit: MAX_PROCS_RING });
        }
        self.ensure(4 * total)?;
        let mut ids = Vec::with_capacity(total);
        for _ in 0..total {
            ids.push(self.proc_id()?);
        }
        Ok(MemberList { ids, active })
    }

    fn rep(&mut self) -> Result<Rep> {
        let proc_id = self.proc_id()?;
        let raw_kind = self.u16()?;
        let kind = RepKind::from_wire(raw_kind).ok_or(Error::InvalidRepKind(raw_kind))?;
        let seg_index = self.u16()?;
        Ok(Rep { proc_id, kind, seg_index })
    }

    fn reps(&mut self) -> Result<RepList> {
        let count = self.u16()? as usize;
        let index = self.u16()? as usize;
        if count > MAX_REPS {
            return Err(Error::TooMany { what: "reps", count, limit: MAX_REPS });
        }
        if index > count {
            return Err(Error::InvalidRing("rep index beyond rep count"));
        }
        self.ensure(REP_SIZE * count)?;
        let mut reps = Vec::with_capacity(count);
        for _ in 0..count {
            reps.push(self.rep()?);
        }
        Ok(RepList { reps, index })
    }

    fn rings(&mut self) -> Result<Vec<RingInfo>> {
        let count = self.u32()? as usize;
        if count > MAX_FORM_RINGS {
            return Err(Error::TooMany { what: "rings", count, limit: MAX_FORM_RINGS });
        }
        let mut rings = Vec::with_capacity(count);
        for _ in 0..count {
            rings.push(self.ring_info()?);
        }
        Ok(rings)
    }

    fn ring_info(&mut self) -> Result<RingInfo> {
        self.ensure(RING_INFO_FIXED)?;
        let memb_id = self.memb_id()?;
        let trans_time = self.u32()?;
        let aru = self.u32()?;
        let highest_seq = self.u32()?;
        let num_holes = self.u32()? as usize;
        let num_commit = self.u16()? as usize;
        let num_trans = self.u16()? as usize;
        if num_holes > MAX_SEQ_GAP {
            return Err(Error::TooMany { what: "holes", count: num_holes, limit: MAX_SEQ_GAP });
        }
        if num_commit > MAX_PROCS_RING {
            return Err(Error::TooMany { what: "commit", count: num_commit, limit: MAX_PROCS_RING });
        }
        if num_trans < 1 || num_trans > num_commit {
            return Err(Error::InvalidRing("transitional set must be a non-empty prefix of the commit set"));
        }
        self.ensure(4 * (num_holes + num_commit))?;
        let mut holes = Vec::with_capacity(num_holes);
        for _ in 0..num_holes {
            holes.push(self.u32()?);
        }
        let mut commit = Vec::with_capacity(num_commit);
        for _ in 0..num_commit {
            commit.push(self.proc_id()?);
        }
        Ok(RingInfo { memb_id, trans_time, aru, highest_seq, holes, commit, num_trans })
    }

    fn rtr(&mut self) -> Result<RingRtr> {
        self.ensure(RING_RTR_FIXED)?;
        let memb_id = self.memb_id()?;
        let proc_id = self.opt_proc()?;
        let seg_raw = self.u16()?;
        let count = self.u16()? as usize;
        self.ensure(4 * count)?;
        let mut seqs = Vec::with_capacity(count);
        for _ in 0..count {
            seqs.push(self.u32()?);
        }
        let seg_index = if seg_raw == NO_SEGMENT { None } else { Some(seg_raw) };
        Ok(RingRtr { memb_id, proc_id, seg_index, seqs })
    }
}
