//! DNS parsing utility.
//!
//! [DnsMessage] is the logic representation of a DNS message, either a query or a response.
//! `DnsOutPacket` encodes a [DnsMessage] into its wire format.
//! `DnsIncoming` decodes the wire format back into a [DnsMessage].
//!
//! Names are always written as literal labels. Compression pointers are only
//! understood when reading.

#[cfg(feature = "logging")]
use crate::log::trace;

use crate::error::{Error, Result};
use std::{collections::HashSet, fmt};

/// DNS resource record types, stored as `u16`. Can do `as u16` when needed.
///
/// Only the common types are listed. Records of any other type are still
/// carried as raw `u16` values and opaque RDATA.
///
/// See [RFC 1035 section 3.2.2](https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.2)
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
#[non_exhaustive]
#[repr(u16)]
pub enum RRType {
    /// DNS record type for IPv4 address
    A = 1,

    /// DNS record type for Name Server
    NS = 2,

    /// DNS record type for Canonical Name
    CNAME = 5,

    /// DNS record type for Start of Authority
    SOA = 6,

    /// DNS record type for Pointer
    PTR = 12,

    /// DNS record type for Mail Exchange
    MX = 15,

    /// DNS record type for Text (properties)
    TXT = 16,

    /// DNS record type for IPv6 address
    AAAA = 28,

    /// DNS record type for Service
    SRV = 33,

    /// EDNS(0) pseudo record type
    OPT = 41,

    /// DNS record type for any records (wildcard)
    ANY = 255,
}

impl RRType {
    /// Converts `u16` into `RRType` if possible.
    pub const fn from_u16(value: u16) -> Option<RRType> {
        match value {
            1 => Some(RRType::A),
            2 => Some(RRType::NS),
            5 => Some(RRType::CNAME),
            6 => Some(RRType::SOA),
            12 => Some(RRType::PTR),
            15 => Some(RRType::MX),
            16 => Some(RRType::TXT),
            28 => Some(RRType::AAAA),
            33 => Some(RRType::SRV),
            41 => Some(RRType::OPT),
            255 => Some(RRType::ANY),
            _ => None,
        }
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRType::A => write!(f, "TYPE_A"),
            RRType::NS => write!(f, "TYPE_NS"),
            RRType::CNAME => write!(f, "TYPE_CNAME"),
            RRType::SOA => write!(f, "TYPE_SOA"),
            RRType::PTR => write!(f, "TYPE_PTR"),
            RRType::MX => write!(f, "TYPE_MX"),
            RRType::TXT => write!(f, "TYPE_TXT"),
            RRType::AAAA => write!(f, "TYPE_AAAA"),
            RRType::SRV => write!(f, "TYPE_SRV"),
            RRType::OPT => write!(f, "TYPE_OPT"),
            RRType::ANY => write!(f, "TYPE_ANY"),
        }
    }
}

/// The class value for the Internet.
pub const CLASS_IN: u16 = 1;

/// The record type of the EDNS(0) OPT pseudo record.
pub const TYPE_OPT: u16 = RRType::OPT as u16;

/// The UDP payload size we advertise in a bare OPT record.
pub const EDNS_UDP_PAYLOAD_SIZE: u16 = 1232;

/// Size of the fixed DNS message header.
pub const MSG_HEADER_LEN: usize = 12;

const MAX_LABEL_LEN: usize = 63;

/// Max length of an encoded name, including length bytes and the root label.
const MAX_NAME_LEN: usize = 255;

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

/// mask for the 4-bit Opcode, shifted left by 11.
pub const FLAGS_OPCODE_MASK: u16 = 0x7800;

/// Flag bit for Authoritative Answer
pub const FLAGS_AA: u16 = 0x0400;

/// Flag bit for TC (Truncated)
pub const FLAGS_TC: u16 = 0x0200;

/// Flag bit for Recursion Desired
pub const FLAGS_RD: u16 = 0x0100;

/// Flag bit for Recursion Available
pub const FLAGS_RA: u16 = 0x0080;

/// mask for the 4-bit response code.
pub const FLAGS_RCODE_MASK: u16 = 0x000F;

/// Response code: no error.
pub const RCODE_NOERROR: u16 = 0;

/// Response code: the server was unable to process the query.
pub const RCODE_FORMERR: u16 = 1;

/// Response code: the server failed to complete the request.
pub const RCODE_SERVFAIL: u16 = 2;

/// Response code: the domain name does not exist.
pub const RCODE_NXDOMAIN: u16 = 3;

const U16_SIZE: usize = 2;

/// The 12-byte header of every DNS message.
///
/// The four counts are only meaningful on a decoded message. When encoding,
/// [DnsMessage::to_bytes] always recomputes them from its record lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub num_questions: u16,
    pub num_answers: u16,
    pub num_authorities: u16,
    pub num_additionals: u16,
}

impl DnsHeader {
    /// Parses only the header of `data`, ignoring whatever follows.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MSG_HEADER_LEN {
            return Err(Error::TooShort(data.len()));
        }

        Ok(Self {
            id: u16_from_be_slice(&data[..2]),
            flags: u16_from_be_slice(&data[2..4]),
            num_questions: u16_from_be_slice(&data[4..6]),
            num_answers: u16_from_be_slice(&data[6..8]),
            num_authorities: u16_from_be_slice(&data[8..10]),
            num_additionals: u16_from_be_slice(&data[10..12]),
        })
    }

    pub const fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    pub const fn is_response(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_RESPONSE
    }

    pub const fn opcode(&self) -> u8 {
        ((self.flags & FLAGS_OPCODE_MASK) >> 11) as u8
    }

    pub const fn authoritative(&self) -> bool {
        (self.flags & FLAGS_AA) != 0
    }

    pub const fn truncated(&self) -> bool {
        (self.flags & FLAGS_TC) != 0
    }

    pub const fn recursion_desired(&self) -> bool {
        (self.flags & FLAGS_RD) != 0
    }

    pub const fn recursion_available(&self) -> bool {
        (self.flags & FLAGS_RA) != 0
    }

    pub const fn rcode(&self) -> u16 {
        self.flags & FLAGS_RCODE_MASK
    }
}

/// A DNS question entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    name: String,
    wire_name: Vec<u8>,
    ty: u16,
    class: u16,
}

impl DnsQuestion {
    /// Returns an error if `name` cannot be encoded.
    pub fn new(name: &str, ty: u16, class: u16) -> Result<Self> {
        let wire_name = encode_name(name)?;
        Ok(Self {
            name: name.to_string(),
            wire_name,
            ty,
            class,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn ty(&self) -> u16 {
        self.ty
    }

    pub const fn class(&self) -> u16 {
        self.class
    }
}

/// A DNS Resource Record with opaque RDATA.
/// RFC: https://www.rfc-editor.org/rfc/rfc1035#section-3.2.1
///
/// The RDLENGTH on the wire is always the length of `rdata`, so the two can
/// never disagree.
///
/// An EDNS(0) OPT pseudo record is a plain `DnsRecord` of type [TYPE_OPT]:
/// its class holds the UDP payload size and its TTL holds the extended
/// RCODE, version and flags (RFC 6891 section 6.1.2).
#[derive(Clone, PartialEq, Eq)]
pub struct DnsRecord {
    name: String,
    wire_name: Vec<u8>,
    ty: u16,
    class: u16,
    ttl: u32,
    rdata: Vec<u8>,
}

impl DnsRecord {
    /// Returns an error if `name` cannot be encoded or `rdata` does not fit
    /// in a 16-bit RDLENGTH.
    pub fn new(name: &str, ty: u16, class: u16, ttl: u32, rdata: Vec<u8>) -> Result<Self> {
        let wire_name = encode_name(name)?;
        if rdata.len() > u16::MAX as usize {
            return Err(e_fmt!(
                "RDATA of {} bytes for '{}' exceeds RDLENGTH max",
                rdata.len(),
                name
            ));
        }
        Ok(Self {
            name: name.to_string(),
            wire_name,
            ty,
            class,
            ttl,
            rdata,
        })
    }

    /// Creates a bare OPT pseudo record: root name, no options.
    pub fn new_opt(udp_payload_size: u16) -> Self {
        Self {
            name: ".".to_string(),
            wire_name: vec![0],
            ty: TYPE_OPT,
            class: udp_payload_size,
            ttl: 0,
            rdata: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn ty(&self) -> u16 {
        self.ty
    }

    pub const fn class(&self) -> u16 {
        self.class
    }

    pub const fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn rdata(&self) -> &[u8] {
        &self.rdata
    }

    pub fn rdlength(&self) -> u16 {
        self.rdata.len() as u16
    }

    pub const fn is_opt(&self) -> bool {
        self.ty == TYPE_OPT
    }

    /// Returns the advertised UDP payload size if this is an OPT record.
    pub const fn udp_payload_size(&self) -> Option<u16> {
        if self.is_opt() {
            Some(self.class)
        } else {
            None
        }
    }
}

impl fmt::Debug for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = match RRType::from_u16(self.ty) {
            Some(rr_type) => rr_type.to_string(),
            None => format!("TYPE{}", self.ty),
        };
        f.debug_struct("DnsRecord")
            .field("name", &self.name)
            .field("ty", &ty)
            .field("class", &self.class)
            .field("ttl", &self.ttl)
            .field("rdata", &u8_slice_to_hex(&self.rdata))
            .finish()
    }
}

fn u8_slice_to_hex(slice: &[u8]) -> String {
    const HEX_TABLE: [char; 16] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
    ];

    let mut hex = String::with_capacity(slice.len() * 2 + 2);
    hex.push_str("0x");
    for b in slice {
        hex.push(HEX_TABLE[(b >> 4) as usize]);
        hex.push(HEX_TABLE[(b & 0x0F) as usize]);
    }
    hex
}

/// A DNS message: header and the four sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    pub fn new(id: u16, flags: u16) -> Self {
        Self {
            header: DnsHeader {
                id,
                flags,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Decodes a complete message from `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        DnsIncoming::new(data).read_message()
    }

    /// Encodes the message into its wire format.
    ///
    /// The header counts are taken from the lengths of the record lists,
    /// not from `self.header`. Each list must hold at most 65535 entries.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut packet = DnsOutPacket::new();

        packet.write_header(
            self.header.id,
            self.header.flags,
            self.questions.len() as u16,
            self.answers.len() as u16,
            self.authorities.len() as u16,
            self.additionals.len() as u16,
        );

        for question in self.questions.iter() {
            packet.write_question(question);
        }

        for record in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
        {
            packet.write_record(record);
        }

        packet.to_bytes()
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub const fn is_query(&self) -> bool {
        self.header.is_query()
    }

    pub const fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// Returns the first OPT pseudo record in the additional section, if any.
    pub fn edns(&self) -> Option<&DnsRecord> {
        self.additionals.iter().find(|r| r.is_opt())
    }

    pub fn add_question(&mut self, name: &str, ty: u16) -> Result<()> {
        self.questions.push(DnsQuestion::new(name, ty, CLASS_IN)?);
        Ok(())
    }

    pub fn add_answer(&mut self, record: DnsRecord) {
        self.answers.push(record);
    }

    pub fn add_authority(&mut self, record: DnsRecord) {
        self.authorities.push(record);
    }

    pub fn add_additional(&mut self, record: DnsRecord) {
        self.additionals.push(record);
    }
}

/// An outgoing DNS packet being written.
struct DnsOutPacket {
    data: Vec<u8>,
}

impl DnsOutPacket {
    fn new() -> Self {
        Self {
            data: Vec::with_capacity(512),
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Writes the header fields. Must be the first write of a packet.
    ///
    /// The header format is based on RFC 1035 section 4.1.1:
    /// https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
    //
    //                                  1  1  1  1  1  1
    //    0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                      ID                       |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    QDCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    ANCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    NSCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    ARCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //
    fn write_header(
        &mut self,
        id: u16,
        flags: u16,
        q_count: u16,
        a_count: u16,
        auth_count: u16,
        addi_count: u16,
    ) {
        debug_assert!(self.data.is_empty());
        self.write_short(id);
        self.write_short(flags);
        self.write_short(q_count);
        self.write_short(a_count);
        self.write_short(auth_count);
        self.write_short(addi_count);
    }

    fn write_question(&mut self, question: &DnsQuestion) {
        self.write_bytes(&question.wire_name);
        self.write_short(question.ty);
        self.write_short(question.class);
    }

    /// Writes a record (answer, authoritative answer, additional)
    fn write_record(&mut self, record: &DnsRecord) {
        self.write_bytes(&record.wire_name);
        self.write_short(record.ty);
        self.write_short(record.class);
        self.write_u32(record.ttl);
        self.write_short(record.rdlength());
        self.write_bytes(&record.rdata);
    }

    fn write_bytes(&mut self, s: &[u8]) {
        self.data.extend_from_slice(s);
    }

    fn write_u32(&mut self, int: u32) {
        self.data.extend_from_slice(&int.to_be_bytes());
    }

    fn write_short(&mut self, short: u16) {
        self.data.extend_from_slice(&short.to_be_bytes());
    }
}

/// A cursor over an incoming DNS message.
#[derive(Debug)]
struct DnsIncoming<'a> {
    offset: usize,
    data: &'a [u8],
}

impl<'a> DnsIncoming<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { offset: 0, data }
    }

    /*
    RFC 1035 section 4.1: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1
    ...
    All communications inside of the domain protocol are carried in a single
    format called a message.  The top level format of message is divided
    into 5 sections (some of which are empty in certain cases) shown below:

        +---------------------+
        |        Header       |
        +---------------------+
        |       Question      | the question for the name server
        +---------------------+
        |        Answer       | RRs answering the question
        +---------------------+
        |      Authority      | RRs pointing toward an authority
        +---------------------+
        |      Additional     | RRs holding additional information
        +---------------------+
     */
    fn read_message(mut self) -> Result<DnsMessage> {
        let header = self.read_header()?;
        let questions = self.read_questions(header.num_questions)?;
        let answers = self.read_rr_records(header.num_answers, "answer")?;
        let authorities = self.read_rr_records(header.num_authorities, "authority")?;
        let additionals = self.read_rr_records(header.num_additionals, "additional")?;

        if self.offset < self.data.len() {
            trace!(
                "ignored {} trailing bytes after the last record",
                self.data.len() - self.offset
            );
        }

        Ok(DnsMessage {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    fn read_header(&mut self) -> Result<DnsHeader> {
        let header = DnsHeader::from_bytes(self.data)?;
        self.offset = MSG_HEADER_LEN;

        trace!(
            "read_header: id {}, {} questions {} answers {} authorities {} additionals",
            header.id,
            header.num_questions,
            header.num_answers,
            header.num_authorities,
            header.num_additionals
        );
        Ok(header)
    }

    fn read_questions(&mut self, count: u16) -> Result<Vec<DnsQuestion>> {
        trace!("read_questions: {}", count);
        let mut questions = Vec::new();

        for i in 0..count {
            let (name, wire_name) = self.read_name()?;
            let slice = self.take(4, || format!("question idx {} '{}' type/class", i, name))?;

            questions.push(DnsQuestion {
                name,
                wire_name,
                ty: u16_from_be_slice(&slice[..2]),
                class: u16_from_be_slice(&slice[2..4]),
            });
        }
        Ok(questions)
    }

    /// Decodes a sequence of RR records (in answers, authorities and additionals).
    fn read_rr_records(&mut self, count: u16, section: &str) -> Result<Vec<DnsRecord>> {
        trace!("read_rr_records: {} {}", count, section);
        let mut rr_records = Vec::new();

        // RFC 1035: https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.1
        //
        // All RRs have the same top level format shown below:
        //                               1  1  1  1  1  1
        // 0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                                               |
        // /                                               /
        // /                      NAME                     /
        // |                                               |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                      TYPE                     |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                     CLASS                     |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                      TTL                      |
        // |                                               |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                   RDLENGTH                    |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--|
        // /                     RDATA                     /
        // /                                               /
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+

        // Must have at least TYPE, CLASS, TTL, RDLENGTH fields: 10 bytes.
        const RR_HEADER_REMAIN: usize = 10;

        for i in 0..count {
            let (name, wire_name) = self.read_name()?;
            let slice = self.take(RR_HEADER_REMAIN, || {
                format!("{} RR idx {} '{}' fixed fields", section, i, name)
            })?;

            let ty = u16_from_be_slice(&slice[..2]);
            let class = u16_from_be_slice(&slice[2..4]);
            let ttl = u32_from_be_slice(&slice[4..8]);
            let rdata_len = u16_from_be_slice(&slice[8..10]) as usize;

            let rdata = self
                .take(rdata_len, || {
                    format!(
                        "{} RR idx {} '{}' RDATA length {}",
                        section, i, name, rdata_len
                    )
                })?
                .to_vec();

            let record = DnsRecord {
                name,
                wire_name,
                ty,
                class,
                ttl,
                rdata,
            };
            trace!("read_rr_records: {:?}", &record);
            rr_records.push(record);
        }

        Ok(rr_records)
    }

    /// Returns the next `len` bytes and moves past them, or an error built
    /// from `what` if the data ends before that.
    fn take<F>(&mut self, len: usize, what: F) -> Result<&'a [u8]>
    where
        F: FnOnce() -> String,
    {
        let remain = self.data.len() - self.offset;
        if remain < len {
            return Err(Error::Truncated(format!(
                "{}: need {} bytes, only {} left",
                what(),
                len,
                remain
            )));
        }
        let data: &'a [u8] = self.data;
        let slice = &data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Returns the name in text form and in its uncompressed wire form.
    fn read_name(&mut self) -> Result<(String, Vec<u8>)> {
        let (labels, next) = read_labels(self.data, self.offset)?;
        self.offset = next;
        Ok((labels_to_text(&labels), labels_to_wire(&labels)))
    }
}

/// Decodes the domain name starting at `offset` in the message `data`.
///
/// Returns the name and the offset right after it. The root name decodes to
/// `"."`, any other name has no trailing dot. Label bytes that would not
/// survive the text form are escaped: `.` and `\` as `\.` and `\\`, and bytes
/// outside printable ASCII as `\DDD` (decimal), as in RFC 1035 section 5.1.
///
/// See https://datatracker.ietf.org/doc/html/rfc1035#section-3.1 for
/// domain name encoding.
pub fn decode_name(data: &[u8], offset: usize) -> Result<(String, usize)> {
    let (labels, next) = read_labels(data, offset)?;
    Ok((labels_to_text(&labels), next))
}

/// Reads the raw labels of the name at `offset`, following compression
/// pointers. Returns the labels and the offset right after the name.
fn read_labels(data: &[u8], offset: usize) -> Result<(Vec<&[u8]>, usize)> {
    let mut offset = offset;
    let mut labels: Vec<&[u8]> = Vec::new();
    let mut visited = HashSet::new();

    // Where the caller continues after this name, set by the first pointer.
    let mut next_offset = None;

    // From RFC1035:
    // "...The compression scheme allows a domain name in a message to be
    // represented as either:
    // - a sequence of labels ending in a zero octet
    // - a pointer
    // - a sequence of labels ending with a pointer"
    loop {
        if offset >= data.len() {
            return Err(Error::Truncated(format!(
                "name at offset {} exceeds data length {}",
                offset,
                data.len()
            )));
        }
        let length = data[offset];

        // From RFC1035:
        // "...Since every domain name ends with the null label of
        // the root, a domain name is terminated by a length byte of zero."
        if length == 0 {
            let end = next_offset.unwrap_or(offset + 1);
            return Ok((labels, end));
        }

        // Check the first 2 bits for possible "Message compression".
        match length & 0xC0 {
            0x00 => {
                offset += 1;
                let ending = offset + length as usize;

                // Never read beyond the whole data length.
                if ending > data.len() {
                    return Err(Error::Truncated(format!(
                        "label ending {} exceeds data length {}",
                        ending,
                        data.len()
                    )));
                }

                labels.push(&data[offset..ending]);
                offset = ending;
            }
            0xC0 => {
                // Message compression.
                // See https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
                if data.len() < offset + U16_SIZE {
                    return Err(Error::InvalidCompressionPointer(format!(
                        "pointer at offset {} is cut off at data length {}",
                        offset,
                        data.len()
                    )));
                }
                let pointer = (u16_from_be_slice(&data[offset..]) & 0x3FFF) as usize;
                if pointer >= offset {
                    return Err(Error::InvalidCompressionPointer(format!(
                        "pointer {} at offset {} does not point backward",
                        pointer, offset
                    )));
                }
                if !visited.insert(pointer) {
                    return Err(Error::InvalidCompressionPointer(format!(
                        "pointer {} at offset {} is visited again",
                        pointer, offset
                    )));
                }

                // A pointer marks the end of a domain name.
                if next_offset.is_none() {
                    next_offset = Some(offset + U16_SIZE);
                }
                offset = pointer;
            }
            _ => {
                return Err(e_fmt!(
                    "Bad name with invalid length: 0x{:x} offset {}",
                    length,
                    offset
                ));
            }
        }

        // Labels plus one length byte each, and the root byte.
        let encoded_len: usize = labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
        if encoded_len > MAX_NAME_LEN {
            return Err(e_fmt!(
                "name exceeds {} bytes at offset {}",
                MAX_NAME_LEN,
                offset
            ));
        }
    }
}

fn labels_to_text(labels: &[&[u8]]) -> String {
    if labels.is_empty() {
        return ".".to_string();
    }

    let mut text = String::new();
    for (i, label) in labels.iter().enumerate() {
        if i > 0 {
            text.push('.');
        }
        for &b in label.iter() {
            match b {
                b'.' | b'\\' => {
                    text.push('\\');
                    text.push(b as char);
                }
                0x21..=0x7E => text.push(b as char),
                _ => text.push_str(&format!("\\{:03}", b)),
            }
        }
    }
    text
}

fn labels_to_wire(labels: &[&[u8]]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1);
    for label in labels.iter() {
        wire.push(label.len() as u8);
        wire.extend_from_slice(label);
    }
    wire.push(0); // the root label
    wire
}

/// Encodes `name` as a sequence of literal labels, without compression.
///
/// `""` and `"."` both encode to the root label only. One trailing `.` is
/// ignored. `\.`, `\\` and `\DDD` escapes put the escaped byte into the
/// label, so every name from [decode_name] encodes back to the same labels.
///
/// Returns `Error::InvalidName` for an empty label, a label longer than 63
/// bytes, a name longer than 255 bytes encoded, or a bad escape.
pub fn encode_name(name: &str) -> Result<Vec<u8>> {
    let mut wire = Vec::with_capacity(name.len() + 2);
    if name.is_empty() || name == "." {
        wire.push(0);
        return Ok(wire);
    }

    let bytes = name.as_bytes();
    let mut label = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        match b {
            b'.' => {
                push_label(&mut wire, &label, name)?;
                label.clear();
            }
            b'\\' => {
                let (byte, used) = unescape(&bytes[i..]).ok_or_else(|| {
                    Error::InvalidName(format!("bad escape at byte {} in '{}'", i - 1, name))
                })?;
                label.push(byte);
                i += used;
            }
            _ => label.push(b),
        }
    }

    // Empty only if the name ends with an unescaped ".".
    if !label.is_empty() {
        push_label(&mut wire, &label, name)?;
    }
    wire.push(0); // the root label

    if wire.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "'{}' is {} bytes encoded, max is {}",
            name,
            wire.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(wire)
}

fn push_label(wire: &mut Vec<u8>, label: &[u8], name: &str) -> Result<()> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(Error::InvalidName(format!(
            "a label in '{}' is {} bytes, must be 1 to {}",
            name,
            label.len(),
            MAX_LABEL_LEN
        )));
    }
    wire.push(label.len() as u8);
    wire.extend_from_slice(label);
    Ok(())
}

/// Reads the escape after a `\`: either three decimal digits up to 255, or
/// any one byte taken literally. Returns the byte and how many input bytes
/// were used.
fn unescape(rest: &[u8]) -> Option<(u8, usize)> {
    let first = *rest.first()?;
    if !first.is_ascii_digit() {
        return Some((first, 1));
    }

    let digits = rest.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let value = digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    if value > u8::MAX as u16 {
        return None;
    }
    Some((value as u8, 3))
}

const fn u16_from_be_slice(bytes: &[u8]) -> u16 {
    let u8_array: [u8; 2] = [bytes[0], bytes[1]];
    u16::from_be_bytes(u8_array)
}

const fn u32_from_be_slice(s: &[u8]) -> u32 {
    let u8_array: [u8; 4] = [s[0], s[1], s[2], s[3]];
    u32::from_be_bytes(u8_array)
}
