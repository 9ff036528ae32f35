//! DNS message parsing and manipulation
//!
//! The forwarder never needs a full-fidelity DNS model: it reads the
//! header and the first question, tracks at most one OPT pseudo-record,
//! and patches two header bytes for the ServFail fallback. This module
//! implements exactly that, directly over the RFC 1035 wire format.
//!
//! Raw-message helpers ([`get_id`], [`set_id`], [`set_rcode`],
//! [`session_key`]) operate on byte slices without materializing a parsed
//! message; [`QueryMsg`] is the parsed view used on the query rewrite
//! path (ECS injection and repacking).
//!
//! # Names
//!
//! Owner names travel through this module as raw bytes in dotted form
//! (trailing dot included): RFC 2181 permits arbitrary octets inside
//! labels, and the forwarder must hand them back to the wire unchanged.
//! A lossy UTF-8 view exists only for logging.
//!
//! # Session keys
//!
//! A session key is `"{id}:{qtype}:{qname}"` with the owner name
//! ASCII-lowercased and in dotted form (trailing dot included). Two
//! messages share a key iff their `(id, qtype, lowercased qname)` triples
//! are equal, which is what matches a response to its outstanding query.

use std::borrow::Cow;
use std::net::IpAddr;

use bytes::BufMut;

use super::error::{DnsError, DnsResult};

/// Minimum DNS message size (header only).
pub const HEADER_SIZE: usize = 12;

/// EDNS(0) UDP payload size advertised on rewritten queries (RFC 6891).
pub const MAX_PAYLOAD_SIZE: u16 = 1232;

/// EDNS option code for Client Subnet (RFC 7871).
pub const OPTION_CODE_SUBNET: u16 = 8;

/// Default ECS source prefix length for IPv4.
pub const IPV4_PREFIX_LENGTH: u8 = 24;
/// Default ECS source prefix length for IPv6.
pub const IPV6_PREFIX_LENGTH: u8 = 56;

/// Query type A.
pub const TYPE_A: u16 = 1;
/// Query type AAAA.
pub const TYPE_AAAA: u16 = 28;
/// Pseudo-RR type OPT (RFC 6891).
pub const TYPE_OPT: u16 = 41;
/// Class IN.
pub const CLASS_IN: u16 = 1;

/// RCODE ServFail.
pub const RCODE_SERVFAIL: u8 = 2;

/// Upper bound on compression-pointer jumps while decoding one name.
const MAX_POINTER_JUMPS: usize = 64;

// ----------------------------------------------------------------------------
// Raw message helpers
// ----------------------------------------------------------------------------

/// Read the message ID from a raw message.
///
/// # Errors
///
/// Fails when the message is shorter than a header.
pub fn get_id(msg: &[u8]) -> DnsResult<u16> {
    if msg.len() < HEADER_SIZE {
        return Err(DnsError::parse("message shorter than header"));
    }
    Ok(u16::from_be_bytes([msg[0], msg[1]]))
}

/// Overwrite the message ID of a raw message in place.
///
/// # Errors
///
/// Fails when the message is shorter than a header.
pub fn set_id(msg: &mut [u8], id: u16) -> DnsResult<()> {
    if msg.len() < HEADER_SIZE {
        return Err(DnsError::parse("message shorter than header"));
    }
    msg[0..2].copy_from_slice(&id.to_be_bytes());
    Ok(())
}

/// Turn a raw query into a response carrying `rcode`, in place.
///
/// Sets the QR bit and replaces the low nibble of the flags; all other
/// bytes are left untouched so the reply mirrors the question section of
/// the original query.
///
/// # Errors
///
/// Fails when the message is shorter than a header.
pub fn set_rcode(msg: &mut [u8], rcode: u8) -> DnsResult<()> {
    if msg.len() < HEADER_SIZE {
        return Err(DnsError::parse("message shorter than header"));
    }
    msg[2] |= 0x80;
    msg[3] = (msg[3] & 0xF0) | (rcode & 0x0F);
    Ok(())
}

/// Compose the session key of a raw message.
///
/// Parses only the header and the first question, which makes this the
/// cheap variant used on the response path.
///
/// # Errors
///
/// Fails on a truncated header, `QDCOUNT == 0`, or a malformed first
/// question.
pub fn session_key(msg: &[u8]) -> DnsResult<String> {
    let mut cur = Cursor::new(msg);
    let id = cur.read_u16()?;
    cur.skip(2)?; // flags
    let qdcount = cur.read_u16()?;
    if qdcount == 0 {
        return Err(DnsError::parse("message has no question"));
    }
    cur.skip(6)?; // ancount, nscount, arcount

    let name = cur.read_name()?;
    let qtype = cur.read_u16()?;
    cur.read_u16()?; // qclass

    Ok(format_session_key(id, qtype, &name))
}

/// Name bytes are folded to ASCII lower case and mapped byte-for-byte
/// onto `char`s. The mapping is injective, so two messages share a key
/// iff their `(id, qtype, lowercased name bytes)` triples are equal,
/// even for labels carrying non-ASCII octets.
fn format_session_key(id: u16, qtype: u16, qname: &[u8]) -> String {
    let mut key = format!("{id}:{qtype}:");
    key.reserve(qname.len());
    for &b in qname {
        key.push(char::from(b.to_ascii_lowercase()));
    }
    key
}

// ----------------------------------------------------------------------------
// Parsed query view
// ----------------------------------------------------------------------------

/// Fixed header of a DNS message; section counts are implied by the
/// parsed contents and recomputed on build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message ID.
    pub id: u16,
    /// Flags word (QR/opcode/AA/TC/RD/RA/Z/RCODE).
    pub flags: u16,
}

/// The first (and only retained) question of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Owner name in dotted form with trailing dot, label bytes exactly
    /// as received (e.g. `www.Example.COM.`). Labels may contain
    /// arbitrary octets, so this is not necessarily valid UTF-8.
    pub name: Vec<u8>,
    /// Query type.
    pub qtype: u16,
    /// Query class.
    pub qclass: u16,
}

/// One EDNS option inside the OPT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdnsOption {
    /// Option code.
    pub code: u16,
    /// Raw option data.
    pub data: Vec<u8>,
}

/// The OPT pseudo-record (RFC 6891), with the repurposed CLASS and TTL
/// fields unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptRecord {
    /// Requestor's maximum UDP payload size (stored in CLASS).
    pub payload_size: u16,
    /// Extended RCODE bits (upper byte of TTL).
    pub extended_rcode: u8,
    /// EDNS version.
    pub version: u8,
    /// EDNS flags (DO bit and reserved).
    pub flags: u16,
    /// Options in wire order.
    pub options: Vec<EdnsOption>,
}

impl OptRecord {
    fn edns0() -> Self {
        Self {
            payload_size: MAX_PAYLOAD_SIZE,
            extended_rcode: 0,
            version: 0,
            flags: 0,
            options: Vec::new(),
        }
    }
}

/// Parsed view of a DNS query.
///
/// Exactly one question is retained; answer and authority sections are
/// skipped, and only the first OPT found among the additionals is
/// materialized (some upstreams produce duplicates; later ones are
/// dropped). Mutation is confined to [`QueryMsg::opt`].
#[derive(Debug, Clone)]
pub struct QueryMsg {
    /// Message header.
    pub header: Header,
    /// The first question.
    pub question: Question,
    /// The OPT pseudo-record, if any.
    pub opt: Option<OptRecord>,
}

impl QueryMsg {
    /// Parse a raw query.
    ///
    /// # Errors
    ///
    /// Fails on header truncation, `QDCOUNT == 0`, bad compression
    /// pointers, or OPT parse failure.
    pub fn parse(msg: &[u8]) -> DnsResult<Self> {
        let mut cur = Cursor::new(msg);

        let id = cur.read_u16()?;
        let flags = cur.read_u16()?;
        let qdcount = cur.read_u16()?;
        let ancount = cur.read_u16()?;
        let nscount = cur.read_u16()?;
        let arcount = cur.read_u16()?;

        if qdcount == 0 {
            return Err(DnsError::parse("message has no question"));
        }

        let name = cur.read_name()?;
        let qtype = cur.read_u16()?;
        let qclass = cur.read_u16()?;
        let question = Question { name, qtype, qclass };

        // Ignore possible other questions.
        for _ in 1..qdcount {
            cur.read_name()?;
            cur.skip(4)?;
        }

        // Skip answer and authority sections.
        for _ in 0..u32::from(ancount) + u32::from(nscount) {
            cur.skip_record()?;
        }

        // Walk the additionals for EDNS.
        let mut opt = None;
        for _ in 0..arcount {
            let rtype = cur.peek_record_type()?;
            if rtype == TYPE_OPT && opt.is_none() {
                opt = Some(cur.read_opt_record()?);
            } else {
                cur.skip_record()?;
            }
        }

        Ok(Self {
            header: Header { id, flags },
            question,
            opt,
        })
    }

    /// Query type of the retained question.
    #[must_use]
    pub fn qtype(&self) -> u16 {
        self.question.qtype
    }

    /// Owner name of the retained question, bytes exactly as received.
    #[must_use]
    pub fn qname(&self) -> &[u8] {
        &self.question.name
    }

    /// Owner name for display and logging; non-UTF-8 label bytes are
    /// replaced, so this form never goes back on the wire.
    #[must_use]
    pub fn qname_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.question.name)
    }

    /// Compose the session key (see module docs).
    #[must_use]
    pub fn session_key(&self) -> String {
        format_session_key(self.header.id, self.question.qtype, &self.question.name)
    }

    /// Attach or overwrite the EDNS Client-Subnet option (RFC 7871).
    ///
    /// Creates the OPT record when absent; either way its header fields
    /// are reset to the EDNS(0) defaults with a payload size of
    /// [`MAX_PAYLOAD_SIZE`]. A `prefix_len` of 0 or out of range for the
    /// family is replaced by the family default (/24 for IPv4, /56 for
    /// IPv6). The address is masked to the prefix and truncated to
    /// `ceil(prefix / 8)` bytes; the scope prefix length is 0 on queries.
    ///
    /// # Errors
    ///
    /// Fails when `addr` is the unspecified address.
    pub fn set_ecs(&mut self, addr: IpAddr, prefix_len: u8) -> DnsResult<()> {
        if addr.is_unspecified() {
            return Err(DnsError::build("unspecified address for client subnet"));
        }

        let (family, prefix_len, address) = match addr {
            IpAddr::V4(v4) => {
                let plen = if prefix_len == 0 || prefix_len > 32 {
                    IPV4_PREFIX_LENGTH
                } else {
                    prefix_len
                };
                let mask = u32::MAX << (32 - u32::from(plen));
                let masked = (u32::from(v4) & mask).to_be_bytes();
                (1u16, plen, masked[..prefix_octets(plen)].to_vec())
            }
            IpAddr::V6(v6) => {
                let plen = if prefix_len == 0 || prefix_len > 128 {
                    IPV6_PREFIX_LENGTH
                } else {
                    prefix_len
                };
                let mask = u128::MAX << (128 - u32::from(plen));
                let masked = (u128::from(v6) & mask).to_be_bytes();
                (2u16, plen, masked[..prefix_octets(plen)].to_vec())
            }
        };

        // Option data: family (2B) | source prefix (1B) | scope prefix (1B)
        // | address truncated to the source prefix.
        let mut data = Vec::with_capacity(4 + address.len());
        data.put_u16(family);
        data.put_u8(prefix_len);
        data.put_u8(0);
        data.extend_from_slice(&address);

        let opt = self.opt.get_or_insert_with(OptRecord::edns0);
        opt.payload_size = MAX_PAYLOAD_SIZE;
        opt.extended_rcode = 0;
        opt.version = 0;

        if let Some(existing) = opt
            .options
            .iter_mut()
            .find(|o| o.code == OPTION_CODE_SUBNET)
        {
            existing.data = data;
        } else {
            opt.options.push(EdnsOption {
                code: OPTION_CODE_SUBNET,
                data,
            });
        }

        Ok(())
    }

    /// Re-pack the query into wire format.
    ///
    /// The output carries the stored header, exactly one question, and
    /// at most one OPT additional; answer and authority sections are
    /// always empty.
    ///
    /// # Errors
    ///
    /// Fails when the owner name does not encode (oversized label or
    /// name).
    pub fn build(&self) -> DnsResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.question.name.len() + 32);

        buf.put_u16(self.header.id);
        buf.put_u16(self.header.flags);
        buf.put_u16(1); // QDCOUNT
        buf.put_u16(0); // ANCOUNT
        buf.put_u16(0); // NSCOUNT
        buf.put_u16(u16::from(self.opt.is_some()));

        write_name(&mut buf, &self.question.name)?;
        buf.put_u16(self.question.qtype);
        buf.put_u16(self.question.qclass);

        if let Some(opt) = &self.opt {
            buf.put_u8(0); // root owner name
            buf.put_u16(TYPE_OPT);
            buf.put_u16(opt.payload_size);
            buf.put_u8(opt.extended_rcode);
            buf.put_u8(opt.version);
            buf.put_u16(opt.flags);

            let rdlen: usize = opt.options.iter().map(|o| 4 + o.data.len()).sum();
            let rdlen = u16::try_from(rdlen)
                .map_err(|_| DnsError::build("OPT record data too long"))?;
            buf.put_u16(rdlen);
            for option in &opt.options {
                buf.put_u16(option.code);
                let olen = u16::try_from(option.data.len())
                    .map_err(|_| DnsError::build("EDNS option data too long"))?;
                buf.put_u16(olen);
                buf.extend_from_slice(&option.data);
            }
        }

        Ok(buf)
    }
}

/// Bytes needed to carry `prefix_len` bits.
fn prefix_octets(prefix_len: u8) -> usize {
    (usize::from(prefix_len) + 7) / 8
}

/// Encode a dotted raw-byte name into wire-format labels.
fn write_name(buf: &mut Vec<u8>, name: &[u8]) -> DnsResult<()> {
    let name = name.strip_suffix(b".").unwrap_or(name);
    if !name.is_empty() {
        for label in name.split(|&b| b == b'.') {
            if label.is_empty() {
                return Err(DnsError::build("empty label in name"));
            }
            if label.len() > 63 {
                return Err(DnsError::build("label exceeds 63 octets"));
            }
            buf.put_u8(label.len() as u8);
            buf.extend_from_slice(label);
        }
    }
    buf.put_u8(0);
    if buf.len() > u16::MAX as usize {
        return Err(DnsError::build("message too long"));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Wire cursor
// ----------------------------------------------------------------------------

/// Bounds-checked reader over a raw message.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> DnsResult<u8> {
        let b = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| DnsError::parse("truncated message"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> DnsResult<u16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn skip(&mut self, n: usize) -> DnsResult<()> {
        if self.buf.len() - self.pos < n {
            return Err(DnsError::parse("truncated message"));
        }
        self.pos += n;
        Ok(())
    }

    fn read_bytes(&mut self, n: usize) -> DnsResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(DnsError::parse("truncated message"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Decode a possibly-compressed name into dotted raw-byte form with
    /// a trailing dot; label bytes are copied verbatim. The cursor
    /// advances past the name as it occurs in the stream; pointer
    /// targets do not move it.
    fn read_name(&mut self) -> DnsResult<Vec<u8>> {
        let mut name: Vec<u8> = Vec::new();
        let mut pos = self.pos;
        let mut next_pos = None; // stream position after the first pointer
        let mut jumps = 0;

        loop {
            let len = *self
                .buf
                .get(pos)
                .ok_or_else(|| DnsError::parse("truncated name"))?;
            match len & 0xC0 {
                0x00 => {
                    if len == 0 {
                        pos += 1;
                        break;
                    }
                    let label = self
                        .buf
                        .get(pos + 1..pos + 1 + usize::from(len))
                        .ok_or_else(|| DnsError::parse("truncated label"))?;
                    name.extend_from_slice(label);
                    name.push(b'.');
                    pos += 1 + usize::from(len);
                }
                0xC0 => {
                    let lo = *self
                        .buf
                        .get(pos + 1)
                        .ok_or_else(|| DnsError::parse("truncated compression pointer"))?;
                    let target = usize::from(u16::from_be_bytes([len & 0x3F, lo]));
                    if target >= self.buf.len() {
                        return Err(DnsError::parse("compression pointer out of range"));
                    }
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(DnsError::parse("compression pointer loop"));
                    }
                    if next_pos.is_none() {
                        next_pos = Some(pos + 2);
                    }
                    pos = target;
                }
                _ => return Err(DnsError::parse("reserved label type")),
            }
        }

        if name.is_empty() {
            name.push(b'.');
        }
        if name.len() > 255 {
            return Err(DnsError::parse("name exceeds 255 octets"));
        }

        self.pos = next_pos.unwrap_or(pos);
        Ok(name)
    }

    /// Record type of the resource record at the cursor, without
    /// consuming it.
    fn peek_record_type(&mut self) -> DnsResult<u16> {
        let saved = self.pos;
        self.read_name()?;
        let rtype = self.read_u16()?;
        self.pos = saved;
        Ok(rtype)
    }

    /// Skip one resource record (name + fixed fields + RDATA).
    fn skip_record(&mut self) -> DnsResult<()> {
        self.read_name()?;
        self.skip(8)?; // type, class, ttl
        let rdlen = self.read_u16()?;
        self.skip(usize::from(rdlen))
    }

    /// Decode one OPT record at the cursor.
    fn read_opt_record(&mut self) -> DnsResult<OptRecord> {
        let owner = self.read_name()?;
        if owner.as_slice() != b"." {
            return Err(DnsError::parse("OPT record with non-root owner name"));
        }
        let rtype = self.read_u16()?;
        if rtype != TYPE_OPT {
            return Err(DnsError::parse("not an OPT record"));
        }

        let payload_size = self.read_u16()?;
        let extended_rcode = self.read_u8()?;
        let version = self.read_u8()?;
        let flags = self.read_u16()?;
        let rdlen = usize::from(self.read_u16()?);

        let end = self
            .pos
            .checked_add(rdlen)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| DnsError::parse("truncated OPT record"))?;

        let mut options = Vec::new();
        while self.pos < end {
            let code = self.read_u16()?;
            let olen = usize::from(self.read_u16()?);
            if self.pos + olen > end {
                return Err(DnsError::parse("EDNS option overruns OPT record"));
            }
            let data = self.read_bytes(olen)?.to_vec();
            options.push(EdnsOption { code, data });
        }
        if self.pos != end {
            return Err(DnsError::parse("trailing bytes inside OPT record"));
        }

        Ok(OptRecord {
            payload_size,
            extended_rcode,
            version,
            flags,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    /// id=0x1234, RD, one question: A www.example.com
    fn sample_query() -> Vec<u8> {
        vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x03, b'w', b'w', b'w', 0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', //
            0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
        ]
    }

    /// Same question plus an OPT record with payload size 4096 and one
    /// cookie-like option (code 10, 8 data bytes).
    fn sample_query_with_opt() -> Vec<u8> {
        let mut msg = sample_query();
        msg[11] = 1; // ARCOUNT
        msg.extend_from_slice(&[
            0x00, // root
            0x00, 0x29, // OPT
            0x10, 0x00, // payload 4096
            0x00, 0x00, 0x00, 0x00, // ext-rcode, version, flags
            0x00, 0x0C, // rdlen
            0x00, 0x0A, 0x00, 0x08, 1, 2, 3, 4, 5, 6, 7, 8,
        ]);
        msg
    }

    // ========================================================================
    // Raw Helpers
    // ========================================================================

    #[test]
    fn test_get_set_id() {
        let mut msg = sample_query();
        assert_eq!(get_id(&msg).unwrap(), 0x1234);
        set_id(&mut msg, 0xBEEF).unwrap();
        assert_eq!(get_id(&msg).unwrap(), 0xBEEF);
        assert!(get_id(&msg[..5]).is_err());
    }

    #[test]
    fn test_set_rcode_servfail() {
        let mut msg = sample_query();
        set_rcode(&mut msg, RCODE_SERVFAIL).unwrap();
        assert_eq!(msg.len(), sample_query().len());
        assert_eq!(msg[2] & 0x80, 0x80, "QR bit set");
        assert_eq!(msg[3] & 0x0F, 0x02, "RCODE is ServFail");
        // Everything else untouched.
        assert_eq!(&msg[4..], &sample_query()[4..]);
        assert_eq!(msg[2] & 0x7F, sample_query()[2] & 0x7F);
    }

    #[test]
    fn test_session_key_of_raw() {
        let key = session_key(&sample_query()).unwrap();
        assert_eq!(key, "4660:1:www.example.com.");
    }

    #[test]
    fn test_session_key_lowercases() {
        let mut msg = sample_query();
        msg[13] = b'W';
        msg[14] = b'W';
        assert_eq!(session_key(&msg).unwrap(), "4660:1:www.example.com.");
    }

    #[test]
    fn test_session_key_rejects_no_question() {
        let mut msg = sample_query();
        msg[5] = 0; // QDCOUNT = 0
        assert!(session_key(&msg).is_err());
    }

    // ========================================================================
    // Parsing
    // ========================================================================

    #[test]
    fn test_parse_basic_query() {
        let query = QueryMsg::parse(&sample_query()).unwrap();
        assert_eq!(query.header.id, 0x1234);
        assert_eq!(query.header.flags, 0x0100);
        assert_eq!(query.qname(), b"www.example.com.");
        assert_eq!(query.qname_lossy(), "www.example.com.");
        assert_eq!(query.qtype(), TYPE_A);
        assert_eq!(query.question.qclass, CLASS_IN);
        assert!(query.opt.is_none());
    }

    #[test]
    fn test_parse_preserves_name_case() {
        let mut msg = sample_query();
        msg[13] = b'W';
        let query = QueryMsg::parse(&msg).unwrap();
        assert_eq!(query.qname(), b"wWw.example.com.");
        assert_eq!(query.session_key(), "4660:1:www.example.com.");
    }

    #[test]
    fn test_high_bit_label_bytes_round_trip() {
        // Labels may carry arbitrary octets; they must pass through the
        // parse/build cycle byte-for-byte.
        let mut msg = sample_query();
        msg[13] = 0x80;
        msg[14] = 0xFF;
        msg[15] = 0x01;

        let parsed = QueryMsg::parse(&msg).unwrap();
        assert_eq!(&parsed.qname()[..4], &[0x80, 0xFF, 0x01, b'.']);
        assert_eq!(parsed.build().unwrap(), msg);

        // The session key stays injective in the raw bytes.
        assert_eq!(session_key(&msg).unwrap(), parsed.session_key());
        let mut other = msg.clone();
        other[14] = 0xFE;
        assert_ne!(session_key(&other).unwrap(), session_key(&msg).unwrap());
    }

    #[test]
    fn test_parse_captures_opt() {
        let query = QueryMsg::parse(&sample_query_with_opt()).unwrap();
        let opt = query.opt.expect("OPT present");
        assert_eq!(opt.payload_size, 4096);
        assert_eq!(opt.options.len(), 1);
        assert_eq!(opt.options[0].code, 10);
        assert_eq!(opt.options[0].data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_parse_keeps_first_opt_only() {
        let mut msg = sample_query_with_opt();
        msg[11] = 2; // ARCOUNT = 2
        // Second OPT with payload 512 and no options.
        msg.extend_from_slice(&[
            0x00, 0x00, 0x29, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]);
        let query = QueryMsg::parse(&msg).unwrap();
        assert_eq!(query.opt.unwrap().payload_size, 4096);
    }

    #[test]
    fn test_parse_truncated() {
        assert!(QueryMsg::parse(&sample_query()[..10]).is_err());
        assert!(QueryMsg::parse(&sample_query()[..20]).is_err());
    }

    #[test]
    fn test_parse_no_question() {
        let mut msg = sample_query();
        msg[5] = 0;
        assert!(QueryMsg::parse(&msg).is_err());
    }

    #[test]
    fn test_parse_bad_pointer() {
        let mut msg = sample_query();
        msg[11] = 1; // ARCOUNT
        // Additional whose name is a self-referential pointer.
        let at = msg.len() as u16 | 0xC000;
        msg.extend_from_slice(&at.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0x00, 0x00]);
        assert!(QueryMsg::parse(&msg).is_err());
    }

    #[test]
    fn test_parse_compressed_name_in_response() {
        // Response with one answer whose name points back at the question.
        let mut msg = sample_query();
        msg[2] = 0x81; // QR
        msg[7] = 1; // ANCOUNT
        msg.extend_from_slice(&[
            0xC0, 0x0C, // pointer to offset 12
            0x00, 0x01, 0x00, 0x01, // A IN
            0x00, 0x00, 0x00, 0x3C, // TTL
            0x00, 0x04, 93, 184, 216, 34,
        ]);
        assert_eq!(session_key(&msg).unwrap(), "4660:1:www.example.com.");
        let parsed = QueryMsg::parse(&msg).unwrap();
        assert_eq!(parsed.qname(), b"www.example.com.");
    }

    // ========================================================================
    // ECS Injection
    // ========================================================================

    #[test]
    fn test_set_ecs_v4_default_prefix() {
        let mut query = QueryMsg::parse(&sample_query()).unwrap();
        query
            .set_ecs(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 0)
            .unwrap();

        let opt = query.opt.as_ref().unwrap();
        assert_eq!(opt.payload_size, MAX_PAYLOAD_SIZE);
        let ecs = &opt.options[0];
        assert_eq!(ecs.code, OPTION_CODE_SUBNET);
        // family=1, source=/24, scope=0, 203.0.113.0 truncated to 3 bytes
        assert_eq!(ecs.data, vec![0x00, 0x01, 0x18, 0x00, 0xCB, 0x00, 0x71]);
    }

    #[test]
    fn test_set_ecs_v4_masks_host_bits() {
        let mut query = QueryMsg::parse(&sample_query()).unwrap();
        query
            .set_ecs(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 255)), 20)
            .unwrap();
        let ecs = &query.opt.as_ref().unwrap().options[0];
        // /20 keeps 198.51.96.0, truncated to 3 bytes.
        assert_eq!(ecs.data, vec![0x00, 0x01, 0x14, 0x00, 198, 51, 96]);
    }

    #[test]
    fn test_set_ecs_v6_default_prefix() {
        let mut query = QueryMsg::parse(&sample_query()).unwrap();
        let addr: Ipv6Addr = "2001:db8:aaaa:bbbb:cccc:dddd:eeee:ffff".parse().unwrap();
        query.set_ecs(IpAddr::V6(addr), 0).unwrap();
        let ecs = &query.opt.as_ref().unwrap().options[0];
        assert_eq!(ecs.data[0..2], [0x00, 0x02]);
        assert_eq!(ecs.data[2], IPV6_PREFIX_LENGTH);
        assert_eq!(ecs.data[3], 0);
        // /56 => 7 address bytes, host bits of byte 7 cleared.
        assert_eq!(ecs.data.len(), 4 + 7);
        assert_eq!(&ecs.data[4..], &[0x20, 0x01, 0x0D, 0xB8, 0xAA, 0xAA, 0xBB]);
    }

    #[test]
    fn test_set_ecs_overwrites_existing_option() {
        let mut query = QueryMsg::parse(&sample_query()).unwrap();
        query
            .set_ecs(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 24)
            .unwrap();
        query
            .set_ecs(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 24)
            .unwrap();

        let opt = query.opt.as_ref().unwrap();
        let subnet_options: Vec<_> = opt
            .options
            .iter()
            .filter(|o| o.code == OPTION_CODE_SUBNET)
            .collect();
        assert_eq!(subnet_options.len(), 1);
        assert_eq!(
            subnet_options[0].data,
            vec![0x00, 0x01, 0x18, 0x00, 192, 0, 2]
        );
    }

    #[test]
    fn test_set_ecs_keeps_foreign_options() {
        let mut query = QueryMsg::parse(&sample_query_with_opt()).unwrap();
        query
            .set_ecs(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 24)
            .unwrap();
        let opt = query.opt.as_ref().unwrap();
        assert_eq!(opt.options.len(), 2);
        assert!(opt.options.iter().any(|o| o.code == 10));
        assert!(opt.options.iter().any(|o| o.code == OPTION_CODE_SUBNET));
    }

    #[test]
    fn test_set_ecs_rejects_unspecified() {
        let mut query = QueryMsg::parse(&sample_query()).unwrap();
        assert!(query.set_ecs(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 24).is_err());
    }

    #[test]
    fn test_set_ecs_out_of_range_prefix_defaults() {
        let mut query = QueryMsg::parse(&sample_query()).unwrap();
        query
            .set_ecs(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 33)
            .unwrap();
        assert_eq!(query.opt.as_ref().unwrap().options[0].data[2], 0x18);
    }

    // ========================================================================
    // Build
    // ========================================================================

    #[test]
    fn test_build_roundtrip_plain() {
        let query = QueryMsg::parse(&sample_query()).unwrap();
        let built = query.build().unwrap();
        assert_eq!(built, sample_query());
    }

    #[test]
    fn test_build_single_opt() {
        let mut query = QueryMsg::parse(&sample_query_with_opt()).unwrap();
        query
            .set_ecs(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 24)
            .unwrap();
        let built = query.build().unwrap();

        let reparsed = QueryMsg::parse(&built).unwrap();
        let opt = reparsed.opt.expect("one OPT survives");
        assert_eq!(opt.payload_size, MAX_PAYLOAD_SIZE);
        assert_eq!(opt.options.len(), 2);
        // ARCOUNT is exactly 1.
        assert_eq!(u16::from_be_bytes([built[10], built[11]]), 1);
    }

    #[test]
    fn test_session_key_idempotent_through_build() {
        for msg in [sample_query(), sample_query_with_opt()] {
            let parsed = QueryMsg::parse(&msg).unwrap();
            let rebuilt = parsed.build().unwrap();
            assert_eq!(
                session_key(&rebuilt).unwrap(),
                session_key(&msg).unwrap()
            );
        }
    }

    #[test]
    fn test_build_drops_extra_questions() {
        let mut msg = sample_query();
        msg[5] = 2; // QDCOUNT = 2
        msg.extend_from_slice(&[0x03, b'f', b'o', b'o', 0x00, 0x00, 0x01, 0x00, 0x01]);
        let parsed = QueryMsg::parse(&msg).unwrap();
        assert_eq!(parsed.qname(), b"www.example.com.");
        let built = parsed.build().unwrap();
        assert_eq!(u16::from_be_bytes([built[4], built[5]]), 1);
        assert_eq!(built, sample_query());
    }
}
