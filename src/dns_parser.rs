//! DNS wire format for host address messages.
//!
//! [DnsIncoming] is the logic representation of an incoming DNS packet.
//! [DnsOutgoing] is the logic representation of an outgoing DNS message.
//!
//! Only A and AAAA records are materialized: the responder never consumes
//! any other record type. Records and questions of other types in inbound
//! packets are skipped by length, not treated as errors, because a shared
//! multicast group carries mostly foreign traffic.

use crate::error::{Error, Result};
use crate::log::trace;
use std::{
    collections::HashMap,
    convert::TryInto,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str,
};

/// DNS resource record types, stored as `u16`. Can do `as u16` when needed.
///
/// See [RFC 1035 section 3.2.2](https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.2)
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
#[non_exhaustive]
#[repr(u16)]
pub enum RRType {
    /// DNS record type for IPv4 address
    A = 1,

    /// DNS record type for IPv6 address
    AAAA = 28,

    /// DNS record type for any records (wildcard)
    ANY = 255,
}

impl RRType {
    /// Converts `u16` into `RRType` if possible.
    pub const fn from_u16(value: u16) -> Option<RRType> {
        match value {
            1 => Some(RRType::A),
            28 => Some(RRType::AAAA),
            255 => Some(RRType::ANY),
            _ => None,
        }
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRType::A => write!(f, "TYPE_A"),
            RRType::AAAA => write!(f, "TYPE_AAAA"),
            RRType::ANY => write!(f, "TYPE_ANY"),
        }
    }
}

/// The class value for the Internet.
pub const CLASS_IN: u16 = 1;
pub const CLASS_MASK: u16 = 0x7FFF;

/// Cache-flush bit: the most significant bit of the rrclass field of the resource record.
pub const CLASS_CACHE_FLUSH: u16 = 0x8000;

/// Max size of UDP datagram payload.
///
/// It is calculated as: 9000 bytes - IP header 20 bytes - UDP header 8 bytes.
/// Reference: [RFC6762 section 17](https://datatracker.ietf.org/doc/html/rfc6762#section-17)
pub const MAX_MSG_ABSOLUTE: usize = 8972;

const MSG_HEADER_LEN: usize = 12;

/// Max length of a name label, in octets (RFC 1035 section 2.3.4).
const MAX_LABEL_LEN: usize = 63;

// Definitions for DNS message header "flags" field
//
// The "flags" field is 16-bit long, in this format:
// (RFC 1035 section 4.1.1)
//
//   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
// |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//
pub const FLAGS_QR_MASK: u16 = 0x8000; // mask for query/response bit

/// Flag bit to indicate a query
pub const FLAGS_QR_QUERY: u16 = 0x0000;

/// Flag bit to indicate a response
pub const FLAGS_QR_RESPONSE: u16 = 0x8000;

/// Flag bit for Authoritative Answer
pub const FLAGS_AA: u16 = 0x0400;

const U16_SIZE: usize = 2;

/// Returns `RRType` for a given IP address.
#[inline]
pub const fn ip_address_rr_type(address: &IpAddr) -> RRType {
    match address {
        IpAddr::V4(_) => RRType::A,
        IpAddr::V6(_) => RRType::AAAA,
    }
}

/// A DNS question entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    name: String, // always lower case.
    ty: RRType,
}

impl DnsQuestion {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> RRType {
        self.ty
    }
}

/// A DNS address resource record (A or AAAA).
///
/// The only record kind this crate materializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAddress {
    name: String, // always lower case.
    ty: RRType,
    class: u16,
    cache_flush: bool,
    ttl: u32,
    address: IpAddr,
}

impl DnsAddress {
    pub fn new(name: &str, ty: RRType, class: u16, ttl: u32, address: IpAddr) -> Self {
        Self {
            name: name.to_lowercase(),
            ty,
            class: class & CLASS_MASK,
            cache_flush: (class & CLASS_CACHE_FLUSH) != 0,
            ttl,
            address,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> RRType {
        self.ty
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }
}

/// An incoming DNS message. It could be a query or a response.
#[derive(Debug)]
pub struct DnsIncoming {
    offset: usize,
    data: Vec<u8>,
    questions: Vec<DnsQuestion>,
    records: Vec<DnsAddress>,
    id: u16,
    flags: u16,
    num_questions: u16,
    num_answers: u16,
    num_authorities: u16,
    num_additionals: u16,
}

impl DnsIncoming {
    /// Decodes `data` into a structured message.
    ///
    /// Questions and records of types other than A/AAAA are skipped over;
    /// only truncated or structurally invalid packets return an `Err`.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let mut incoming = Self {
            offset: 0,
            data,
            questions: Vec::new(),
            records: Vec::new(),
            id: 0,
            flags: 0,
            num_questions: 0,
            num_answers: 0,
            num_authorities: 0,
            num_additionals: 0,
        };

        incoming.read_header()?;
        incoming.read_questions()?;

        // The answer, authority and additional sections share one record
        // format. An address record is a disqualifier no matter which
        // section carries it, so they land in one list.
        let record_count = u32::from(incoming.num_answers)
            + u32::from(incoming.num_authorities)
            + u32::from(incoming.num_additionals);
        incoming.read_records(record_count)?;

        Ok(incoming)
    }

    pub fn questions(&self) -> &[DnsQuestion] {
        &self.questions
    }

    /// All decoded address records, in wire order across sections.
    pub fn records(&self) -> &[DnsAddress] {
        &self.records
    }

    pub const fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    pub const fn is_response(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_RESPONSE
    }

    fn read_header(&mut self) -> Result<()> {
        if self.data.len() < MSG_HEADER_LEN {
            return Err(Error::Msg(format!(
                "DNS incoming: header is too short: {} bytes",
                self.data.len()
            )));
        }

        let data = &self.data[0..];
        self.id = u16_from_be_slice(&data[..2]);
        self.flags = u16_from_be_slice(&data[2..4]);
        self.num_questions = u16_from_be_slice(&data[4..6]);
        self.num_answers = u16_from_be_slice(&data[6..8]);
        self.num_authorities = u16_from_be_slice(&data[8..10]);
        self.num_additionals = u16_from_be_slice(&data[10..12]);

        self.offset = MSG_HEADER_LEN;

        trace!(
            "read_header: id {}, {} questions {} answers {} authorities {} additionals",
            self.id,
            self.num_questions,
            self.num_answers,
            self.num_authorities,
            self.num_additionals
        );
        Ok(())
    }

    fn read_questions(&mut self) -> Result<()> {
        trace!("read_questions: {}", &self.num_questions);
        for i in 0..self.num_questions {
            let name = self.read_name()?;

            let data = &self.data[self.offset..];
            if data.len() < 4 {
                return Err(Error::Msg(format!(
                    "DNS incoming: question idx {} too short: {}",
                    i,
                    data.len()
                )));
            }
            let ty = u16_from_be_slice(&data[..2]);
            self.offset += 4;

            // Questions for types we never answer are not interesting.
            match RRType::from_u16(ty) {
                Some(rr_type) => self.questions.push(DnsQuestion { name, ty: rr_type }),
                None => trace!("question qtype {} for {} skipped", ty, &name),
            }
        }
        Ok(())
    }

    /// Decodes a sequence of RR records, keeping the address records.
    fn read_records(&mut self, count: u32) -> Result<()> {
        trace!("read_records: {}", count);

        // RFC 1035 section 3.2.1: every RR has NAME, TYPE, CLASS, TTL and
        // RDLENGTH fields before RDATA; TYPE..RDLENGTH is 10 bytes.
        const RR_HEADER_REMAIN: usize = 10;

        for _ in 0..count {
            let name = self.read_name()?;
            let slice = &self.data[self.offset..];

            if slice.len() < RR_HEADER_REMAIN {
                return Err(Error::Msg(format!(
                    "read_records: RR '{}' is too short after name: {} bytes",
                    &name,
                    slice.len()
                )));
            }

            let ty = u16_from_be_slice(&slice[..2]);
            let class = u16_from_be_slice(&slice[2..4]);
            let ttl = u32_from_be_slice(&slice[4..8]);
            let rdata_len = u16_from_be_slice(&slice[8..10]) as usize;
            self.offset += RR_HEADER_REMAIN;
            let next_offset = self.offset + rdata_len;

            // Sanity check for RDATA length.
            if next_offset > self.data.len() {
                return Err(Error::Msg(format!(
                    "RR {name} RDATA length {rdata_len} is invalid: remain data len: {}",
                    self.data.len() - self.offset
                )));
            }

            match RRType::from_u16(ty) {
                Some(RRType::A) if rdata_len == 4 => {
                    let bytes: [u8; 4] = self.data[self.offset..next_offset]
                        .try_into()
                        .map_err(|e| Error::Msg(format!("read_records: ipv4 rdata: {}", e)))?;
                    let address = IpAddr::V4(Ipv4Addr::from(bytes));
                    self.records
                        .push(DnsAddress::new(&name, RRType::A, class, ttl, address));
                }
                Some(RRType::AAAA) if rdata_len == 16 => {
                    let bytes: [u8; 16] = self.data[self.offset..next_offset]
                        .try_into()
                        .map_err(|e| Error::Msg(format!("read_records: ipv6 rdata: {}", e)))?;
                    let address = IpAddr::V6(Ipv6Addr::from(bytes));
                    self.records
                        .push(DnsAddress::new(&name, RRType::AAAA, class, ttl, address));
                }
                _ => trace!("record type {} for {} skipped", ty, &name),
            }

            self.offset = next_offset;
        }
        Ok(())
    }

    fn read_name(&mut self) -> Result<String> {
        let data = &self.data[..];
        let start_offset = self.offset;
        let mut offset = start_offset;
        let mut name = "".to_string();
        let mut at_end = false;

        // From RFC1035:
        // "...The compression scheme allows a domain name in a message to be
        // represented as either:
        // - a sequence of labels ending in a zero octet
        // - a pointer
        // - a sequence of labels ending with a pointer"
        loop {
            if offset >= data.len() {
                return Err(Error::Msg(format!(
                    "read_name: offset: {} data len {}",
                    offset,
                    data.len(),
                )));
            }
            let length = data[offset];

            // A domain name is terminated by a length byte of zero.
            if length == 0 {
                if !at_end {
                    self.offset = offset + 1;
                }
                break;
            }

            // Check the first 2 bits for possible "Message compression".
            match length & 0xC0 {
                0x00 => {
                    // regular utf8 string with length
                    offset += 1;
                    let ending = offset + length as usize;

                    // Never read beyond the whole data length.
                    if ending > data.len() {
                        return Err(Error::Msg(format!(
                            "read_name: ending {} exceeds data length {}",
                            ending,
                            data.len()
                        )));
                    }

                    name += str::from_utf8(&data[offset..ending])
                        .map_err(|e| Error::Msg(format!("read_name: from_utf8: {}", e)))?;
                    name += ".";
                    offset += length as usize;
                }
                0xC0 => {
                    // Message compression.
                    // See https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
                    let slice = &data[offset..];
                    if slice.len() < U16_SIZE {
                        return Err(Error::Msg(format!(
                            "read_name: u16 slice len is only {}",
                            slice.len()
                        )));
                    }
                    let pointer = (u16_from_be_slice(slice) ^ 0xC000) as usize;
                    if pointer >= start_offset {
                        // Error: could trigger an infinite loop.
                        return Err(Error::Msg(format!(
                            "Invalid name compression: pointer {} must be less than the start offset {}",
                            &pointer, &start_offset
                        )));
                    }

                    // A pointer marks the end of a domain name.
                    if !at_end {
                        self.offset = offset + U16_SIZE;
                        at_end = true;
                    }
                    offset = pointer;
                }
                _ => {
                    return Err(Error::Msg(format!(
                        "Bad name with invalid length: 0x{:x} offset {}",
                        length, offset,
                    )));
                }
            };
        }

        Ok(name.to_lowercase())
    }
}

/// Representation of one outgoing DNS message.
///
/// Built fresh per probe or per reply; never reused across sends. A probe
/// carries questions only, a reply carries answers only, so one packet is
/// always enough.
pub struct DnsOutgoing {
    flags: u16,
    id: u16,
    questions: Vec<DnsQuestion>,
    answers: Vec<DnsAddress>,
}

impl DnsOutgoing {
    pub fn new(flags: u16) -> Self {
        Self {
            flags,
            id: 0, // multicast DNS: query ID is always 0
            questions: Vec::new(),
            answers: Vec::new(),
        }
    }

    /// Creates a reply to `query`, echoing its transaction ID.
    ///
    /// Multicast queries carry ID 0, but a legacy one-shot querier on an
    /// ephemeral port picks a real ID and matches answers against it
    /// (RFC 6762 section 6.7).
    pub fn reply_to(flags: u16, query: &DnsIncoming) -> Self {
        Self {
            flags,
            id: query.id,
            questions: Vec::new(),
            answers: Vec::new(),
        }
    }

    pub fn answers_count(&self) -> usize {
        self.answers.len()
    }

    pub fn add_question(&mut self, name: &str, qtype: RRType) {
        self.questions.push(DnsQuestion {
            name: name.to_lowercase(),
            ty: qtype,
        });
    }

    pub fn add_answer(&mut self, answer: DnsAddress) {
        trace!("add_answer: {:?}", &answer);
        self.answers.push(answer);
    }

    /// Returns the actual DNS packet data to be sent on the wire.
    pub fn to_data_on_wire(&self) -> Vec<u8> {
        let mut packet = DnsOutPacket::new();

        for question in self.questions.iter() {
            packet.write_question(question);
        }

        for answer in self.answers.iter() {
            packet.write_record(answer);
        }

        packet.write_header(
            self.id,
            self.flags,
            self.questions.len() as u16,
            self.answers.len() as u16,
            0,
            0,
        );

        packet.to_bytes()
    }
}

/// The encoded packet for a [DnsOutgoing].
struct DnsOutPacket {
    /// All bytes in `data` concatenated is the actual packet on the wire.
    data: Vec<Vec<u8>>,

    /// Current logical size of the packet. It starts with the size of the mandatory header.
    size: usize,

    /// k: name, v: offset
    names: HashMap<String, u16>,
}

impl DnsOutPacket {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            size: MSG_HEADER_LEN, // Header is mandatory.
            names: HashMap::new(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.data.concat()
    }

    fn write_question(&mut self, question: &DnsQuestion) {
        self.write_name(&question.name);
        self.write_short(question.ty as u16);
        self.write_short(CLASS_IN);
    }

    fn write_record(&mut self, record: &DnsAddress) {
        self.write_name(&record.name);
        self.write_short(record.ty as u16);
        if record.cache_flush {
            self.write_short(record.class | CLASS_CACHE_FLUSH);
        } else {
            self.write_short(record.class);
        }
        self.write_u32(record.ttl);

        // RDATA length and width follow the record type, not the address
        // family: a generator may answer an AAAA query with an interface's
        // IPv4 entry, which goes out as a v4-mapped IPv6 address.
        match record.ty {
            RRType::AAAA => {
                let addr = match record.address {
                    IpAddr::V6(addr) => addr,
                    IpAddr::V4(addr) => addr.to_ipv6_mapped(),
                };
                self.write_short(16);
                self.write_bytes(&addr.octets());
            }
            _ => {
                let addr = match record.address {
                    IpAddr::V4(addr) => addr,
                    IpAddr::V6(addr) => addr.to_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED),
                };
                self.write_short(4);
                self.write_bytes(&addr.octets());
            }
        }
    }

    fn insert_short(&mut self, index: usize, value: u16) {
        self.data.insert(index, value.to_be_bytes().to_vec());
        self.size += 2;
    }

    // Write name to packet
    //
    // [RFC1035]
    // 4.1.4. Message compression
    //
    // In order to reduce the size of messages, the domain system utilizes a
    // compression scheme which eliminates the repetition of domain names in
    // a message. In this scheme, an entire domain name or a list of labels
    // at the end of a domain name is replaced with a pointer to a prior
    // occurrence of the same name.
    fn write_name(&mut self, name: &str) {
        // ignore the ending "." if exists
        let end = name.len();
        let end = if end > 0 && &name[end - 1..] == "." {
            end - 1
        } else {
            end
        };

        let mut here = 0;
        while here < end {
            const POINTER_MASK: u16 = 0xC000;
            let remaining = &name[here..end];

            // Check if 'remaining' already appeared in this message
            match self.names.get(remaining) {
                Some(offset) => {
                    let pointer = *offset | POINTER_MASK;
                    self.write_short(pointer);
                    break;
                }
                None => {
                    // Remember the remaining parts so we can point to it
                    self.names.insert(remaining.to_string(), self.size as u16);

                    // Find the current label to write into the packet
                    let stop = remaining.find('.').map_or(end, |i| here + i);
                    let label = &name[here..stop];
                    self.write_utf8(label);

                    here = stop + 1; // move past the current label
                }
            }

            if here >= end {
                self.write_byte(0); // name ends with 0 if not using a pointer
            }
        }
    }

    fn write_utf8(&mut self, utf: &str) {
        // RFC 1035 section 2.3.4: labels cap at 63 octets. The two high
        // bits of the length byte are the compression-pointer tag, so a
        // longer length would corrupt the wire format. Clamp.
        let label = utf.as_bytes();
        let label = &label[..label.len().min(MAX_LABEL_LEN)];
        self.write_byte(label.len() as u8);
        self.write_bytes(label);
    }

    fn write_bytes(&mut self, s: &[u8]) {
        self.data.push(s.to_vec());
        self.size += s.len();
    }

    fn write_u32(&mut self, int: u32) {
        self.data.push(int.to_be_bytes().to_vec());
        self.size += 4;
    }

    fn write_short(&mut self, short: u16) {
        self.data.push(short.to_be_bytes().to_vec());
        self.size += 2;
    }

    fn write_byte(&mut self, byte: u8) {
        self.data.push(vec![byte]);
        self.size += 1;
    }

    /// Writes the header fields and finish the packet.
    ///
    /// The header format is based on RFC 1035 section 4.1.1:
    /// https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
    fn write_header(
        &mut self,
        id: u16,
        flags: u16,
        q_count: u16,
        a_count: u16,
        auth_count: u16,
        addi_count: u16,
    ) {
        self.insert_short(0, addi_count);
        self.insert_short(0, auth_count);
        self.insert_short(0, a_count);
        self.insert_short(0, q_count);
        self.insert_short(0, flags);
        self.insert_short(0, id);

        // Adjust the size as it was already initialized to include the header.
        self.size -= MSG_HEADER_LEN;
    }
}

const fn u16_from_be_slice(bytes: &[u8]) -> u16 {
    let u8_array: [u8; 2] = [bytes[0], bytes[1]];
    u16::from_be_bytes(u8_array)
}

const fn u32_from_be_slice(s: &[u8]) -> u32 {
    let u8_array: [u8; 4] = [s[0], s[1], s[2], s[3]];
    u32::from_be_bytes(u8_array)
}
