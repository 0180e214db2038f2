//! DNS query construction and delivery.
//!
//! # Building queries
//!
//! [`Query::create`] takes an owner name and a record type mnemonic and returns a query
//! with the defaults a DNSSEC-aware stub would send:
//!
//! * a random transaction id,
//! * `RD` (recursion desired) and `AD` (authenticated data) set, `CD` clear,
//! * EDNS(0) with a 4096 byte payload and the `DO` bit set.
//!
//! Flags can be flipped afterwards, before the query is sent. Nothing is re-validated, so a
//! query with an odd flag combination is delivered as-is and the server under test decides
//! what to make of it.
//!
//! ```no_run
//! # async fn demo() -> Result<(), nsharness::error::Error> {
//! use nsharness::query::{transport, Flag, Query};
//!
//! let mut msg = Query::create("example.", "SOA")?;
//! msg.set_flag(Flag::CD);
//! let res = transport::tcp(&msg, "10.53.0.5:53".parse().unwrap()).await?;
//! nsharness::check::noerror(&res)?;
//! nsharness::check::noadflag(&res)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Sending queries
//!
//! See [`transport`] for the UDP and TCP clients.

pub mod transport;

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use transport::Mode;
use trust_dns_proto::op::{Edns, Message, MessageType, OpCode, Query as Question, ResponseCode};
use trust_dns_proto::rr::{Name, Record, RecordType};

const EDNS_PAYLOAD: u16 = 4096;

/// Header flag bits a query can set and a response can be checked for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
#[allow(clippy::upper_case_acronyms)]
pub enum Flag {
    /// Query/response.
    QR,
    /// Authoritative answer.
    AA,
    /// Truncated.
    TC,
    /// Recursion desired.
    RD,
    /// Recursion available.
    RA,
    /// Authenticated data.
    AD,
    /// Checking disabled.
    CD,
}

impl Flag {
    /// Whether this flag is set in the header of `message`.
    #[must_use]
    pub fn is_set(self, message: &Message) -> bool {
        match self {
            Flag::QR => message.message_type() == MessageType::Response,
            Flag::AA => message.authoritative(),
            Flag::TC => message.truncated(),
            Flag::RD => message.recursion_desired(),
            Flag::RA => message.recursion_available(),
            Flag::AD => message.authentic_data(),
            Flag::CD => message.checking_disabled(),
        }
    }

    fn apply(self, message: &mut Message, value: bool) {
        match self {
            Flag::QR => {
                message.set_message_type(if value {
                    MessageType::Response
                } else {
                    MessageType::Query
                });
            }
            Flag::AA => {
                message.set_authoritative(value);
            }
            Flag::TC => {
                message.set_truncated(value);
            }
            Flag::RD => {
                message.set_recursion_desired(value);
            }
            Flag::RA => {
                message.set_recursion_available(value);
            }
            Flag::AD => {
                message.set_authentic_data(value);
            }
            Flag::CD => {
                message.set_checking_disabled(value);
            }
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Flag::QR => "qr",
            Flag::AA => "aa",
            Flag::TC => "tc",
            Flag::RD => "rd",
            Flag::RA => "ra",
            Flag::AD => "ad",
            Flag::CD => "cd",
        };
        f.write_str(s)
    }
}

/// Response status, i.e. the RCODE of a response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    NoError,
    FormErr,
    ServFail,
    NXDomain,
    NotImp,
    Refused,
    /// Any other RCODE, by numeric value.
    Other(u16),
}

impl From<ResponseCode> for Status {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::NoError => Status::NoError,
            ResponseCode::FormErr => Status::FormErr,
            ResponseCode::ServFail => Status::ServFail,
            ResponseCode::NXDomain => Status::NXDomain,
            ResponseCode::NotImp => Status::NotImp,
            ResponseCode::Refused => Status::Refused,
            other => Status::Other(u16::from(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NoError => f.write_str("NOERROR"),
            Status::FormErr => f.write_str("FORMERR"),
            Status::ServFail => f.write_str("SERVFAIL"),
            Status::NXDomain => f.write_str("NXDOMAIN"),
            Status::NotImp => f.write_str("NOTIMP"),
            Status::Refused => f.write_str("REFUSED"),
            Status::Other(code) => write!(f, "RCODE{code}"),
        }
    }
}

/// A DNS query waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    id: u16,
    name: Name,
    record_type: RecordType,
    flags: BTreeSet<Flag>,
    dnssec_ok: bool,
}

impl Query {
    /// Create a query for `name` and the record type mnemonic `record_type`.
    ///
    /// Names without a trailing dot are taken as absolute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DNSError`] if `name` is not a valid domain name or `record_type` is
    /// not a known record type.
    pub fn create(name: &str, record_type: &str) -> Result<Self, Error> {
        let mut name = Name::from_str(name)?;
        if !name.is_fqdn() {
            name = name.append_domain(&Name::root())?;
        }
        let record_type = RecordType::from_str(&record_type.to_ascii_uppercase())?;
        Ok(Self {
            id: rand::random(),
            name,
            record_type,
            flags: BTreeSet::from([Flag::RD, Flag::AD]),
            dnssec_ok: true,
        })
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &Name {
        &self.name
    }

    #[must_use]
    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    #[must_use]
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Set a header flag.
    pub fn set_flag(&mut self, flag: Flag) -> &mut Self {
        self.flags.insert(flag);
        self
    }

    /// Clear a header flag.
    pub fn clear_flag(&mut self, flag: Flag) -> &mut Self {
        self.flags.remove(&flag);
        self
    }

    /// Stop asking for DNSSEC records (clears the EDNS `DO` bit).
    #[must_use]
    pub fn without_dnssec(mut self) -> Self {
        self.dnssec_ok = false;
        self
    }

    /// The wire message this query encodes to.
    #[must_use]
    pub fn message(&self) -> Message {
        let mut message = Message::new();
        message
            .set_id(self.id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .add_query(Question::query(self.name.clone(), self.record_type));
        for flag in &self.flags {
            flag.apply(&mut message, true);
        }
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        edns.set_version(0);
        edns.set_dnssec_ok(self.dnssec_ok);
        message.set_edns(edns);
        message
    }

    pub(crate) fn to_wire(&self) -> Result<Vec<u8>, Error> {
        Ok(self.message().to_vec()?)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (id {})", self.name, self.record_type, self.id)
    }
}

/// A parsed reply to a [`Query`].
#[derive(Debug, Clone)]
pub struct Response {
    message: Message,
    server: SocketAddr,
    mode: Mode,
}

impl Response {
    pub(crate) fn new(message: Message, server: SocketAddr, mode: Mode) -> Self {
        Self {
            message,
            server,
            mode,
        }
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.message.id()
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.message.response_code().into()
    }

    #[must_use]
    pub fn has_flag(&self, flag: Flag) -> bool {
        flag.is_set(&self.message)
    }

    /// Header flags set in the response, in a fixed order.
    #[must_use]
    pub fn flags(&self) -> Vec<Flag> {
        [
            Flag::QR,
            Flag::AA,
            Flag::TC,
            Flag::RD,
            Flag::RA,
            Flag::AD,
            Flag::CD,
        ]
        .into_iter()
        .filter(|f| self.has_flag(*f))
        .collect()
    }

    #[must_use]
    pub fn answers(&self) -> &[Record] {
        self.message.answers()
    }

    #[must_use]
    pub fn authority(&self) -> &[Record] {
        self.message.name_servers()
    }

    #[must_use]
    pub fn additional(&self) -> &[Record] {
        self.message.additionals()
    }

    /// The server that sent this response.
    #[must_use]
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// The transport this response arrived on.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        response.message
    }
}
