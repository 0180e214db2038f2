//! Stub DNS servers for integration tests.
//!
//! A stub serves a tiny fixed zone set and pretends to validate it against a trust anchor
//! read from its `named.conf`. Reconfiguring through [`StubControl`] re-reads that file and
//! logs the outcome the way `named` does, so the harness can drive a stub exactly like a
//! real server.
#![allow(dead_code)]

use nsharness::error::Error;
use nsharness::query::transport::{self, Mode, TransportOptions};
use nsharness::query::{Flag, Query, Status};
use nsharness::server::control::{Control, ControlOutput, DynControl};
use nsharness::server::{ReloadPolicy, ServerHandle};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use trust_dns_proto::op::{Header, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata::SOA;
use trust_dns_proto::rr::{Name, RData, Record, RecordType};
use trust_dns_server::authority::MessageResponseBuilder;
use trust_dns_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use trust_dns_server::ServerFuture;

pub const CONFIG_FILE: &str = "named.conf";

pub const CONFIG_TEMPLATE: &str = "\
options { directory \"{{ dir }}\"; };
trust-anchor {% if revoked_key %}revoked{% elif broken_key %}broken{% else %}valid{% endif %};
{% if forward_badkey %}forward-to upstream;
{% endif %}";

/// What the stub thinks of its configured trust anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Valid,
    Broken,
    Revoked,
}

impl FromStr for Anchor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Anchor::Valid),
            "broken" => Ok(Anchor::Broken),
            "revoked" => Ok(Anchor::Revoked),
            other => Err(format!("unknown trust-anchor state '{other}'")),
        }
    }
}

/// What a stub loaded from its `named.conf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubConfig {
    pub anchor: Anchor,
    /// Forwarders relay to their upstream only when configured to.
    pub forward: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            anchor: Anchor::Valid,
            forward: false,
        }
    }
}

fn parse_config(contents: &str) -> Result<StubConfig, String> {
    let anchor = contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("trust-anchor "))
        .ok_or_else(|| "no trust-anchor statement".to_string())?
        .trim_end_matches(';')
        .trim()
        .parse()?;
    let forward = contents
        .lines()
        .any(|line| line.trim() == "forward-to upstream;");
    Ok(StubConfig { anchor, forward })
}

async fn append_log(path: &Path, lines: &[&str]) -> io::Result<()> {
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    for line in lines {
        f.write_all(format!("{line}\n").as_bytes()).await?;
    }
    f.flush().await
}

enum Lookup {
    Answer(Vec<Record>),
    NoData(Record),
    NxDomain,
}

fn name(s: &str) -> Name {
    Name::from_ascii(s).unwrap()
}

fn soa_record(zone: &str) -> Record {
    let rdata = RData::SOA(SOA::new(
        name("ns.example."),
        name("hostmaster.example."),
        2023_01_01,
        86_400,
        7_200,
        3_600_000,
        172_800,
    ));
    Record::from_rdata(name(zone), 300, rdata)
}

/// The zones every stub serves: `.`, `example.` and `secure.example.`, the latter with
/// `a.secure.example. A 10.53.0.10`.
fn lookup(qname: &Name, qtype: RecordType) -> Lookup {
    const ZONES: [&str; 3] = ["secure.example.", "example.", "."];
    let a_name = name("a.secure.example.");

    let Some(zone) = ZONES.iter().find(|z| name(z).zone_of(qname)) else {
        return Lookup::NxDomain;
    };
    if *qname == name(zone) {
        return match qtype {
            RecordType::SOA => Lookup::Answer(vec![soa_record(zone)]),
            _ => Lookup::NoData(soa_record(zone)),
        };
    }
    if *qname == a_name {
        return match qtype {
            RecordType::A => Lookup::Answer(vec![Record::from_rdata(
                a_name,
                300,
                RData::A(Ipv4Addr::new(10, 53, 0, 10)),
            )]),
            _ => Lookup::NoData(soa_record(zone)),
        };
    }
    Lookup::NxDomain
}

#[derive(Clone)]
enum Role {
    Resolver,
    Forwarder { upstream: SocketAddr },
}

#[derive(Clone)]
pub struct Handler {
    role: Role,
    config: Arc<RwLock<StubConfig>>,
    log: PathBuf,
}

impl Handler {
    async fn dispatch_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
    ) -> io::Result<ResponseInfo> {
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return self.send_error(request, response, ResponseCode::NotImp).await;
        }
        match &self.role {
            Role::Resolver => self.resolve(request, response).await,
            Role::Forwarder { upstream } if self.config.read().await.forward => {
                self.forward(*upstream, request, response).await
            }
            Role::Forwarder { .. } => self.resolve(request, response).await,
        }
    }

    async fn resolve<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
    ) -> io::Result<ResponseInfo> {
        let anchor = self.config.read().await.anchor;
        let checking_disabled = request.header().checking_disabled();
        if anchor != Anchor::Valid && !checking_disabled {
            return self.send_error(request, response, ResponseCode::ServFail).await;
        }

        let query = request.query();
        let (rcode, answers, authority) = match lookup(&query.name().into(), query.query_type()) {
            Lookup::Answer(records) => (ResponseCode::NoError, records, vec![]),
            Lookup::NoData(soa) => (ResponseCode::NoError, vec![], vec![soa]),
            Lookup::NxDomain => (ResponseCode::NXDomain, vec![], vec![]),
        };
        self.send_answer(
            request,
            response,
            rcode,
            anchor == Anchor::Valid,
            &answers,
            &authority,
        )
        .await
    }

    /// Forward without CD first; when the upstream fails validation, log it and ask again
    /// with CD set, validating the answer against our own anchor.
    async fn forward<R: ResponseHandler>(
        &self,
        upstream: SocketAddr,
        request: &Request,
        response: R,
    ) -> io::Result<ResponseInfo> {
        let query = request.query();
        let options = TransportOptions {
            timeout: Duration::from_secs(2),
            attempts: 1,
            retry_delay: Duration::ZERO,
        };
        let Ok(mut upstream_query) =
            Query::create(&query.name().to_string(), &query.query_type().to_string())
        else {
            return self.send_error(request, response, ResponseCode::FormErr).await;
        };

        let mut reply = transport::send(&upstream_query, upstream, Mode::Udp, &options).await;
        if let Ok(res) = &reply {
            if res.status() == Status::ServFail {
                let line = format!(
                    "forwarding {upstream_query} to {upstream}: status: SERVFAIL, retrying with CD"
                );
                append_log(&self.log, &[&line]).await?;
                upstream_query.set_flag(Flag::CD);
                reply = transport::send(&upstream_query, upstream, Mode::Udp, &options).await;
            }
        }

        let anchor = self.config.read().await.anchor;
        match reply {
            Ok(res) if res.status() != Status::ServFail && anchor == Anchor::Valid => {
                self.send_answer(
                    request,
                    response,
                    res.message().response_code(),
                    true,
                    res.answers(),
                    res.authority(),
                )
                .await
            }
            _ => self.send_error(request, response, ResponseCode::ServFail).await,
        }
    }

    async fn send_answer<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        rcode: ResponseCode,
        authentic: bool,
        answers: &[Record],
        authority: &[Record],
    ) -> io::Result<ResponseInfo> {
        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);
        header.set_authentic_data(authentic);
        header.set_response_code(rcode);
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(header, answers.iter(), &[], authority.iter(), &[]);
        response_handle.send_response(response).await
    }

    async fn send_error<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        rcode: ResponseCode,
    ) -> io::Result<ResponseInfo> {
        let builder = MessageResponseBuilder::from_message_request(request);
        response_handle
            .send_response(builder.error_msg(request.header(), rcode))
            .await
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self.dispatch_request(request, response_handle).await {
            Ok(info) => info,
            Err(error) => {
                tracing::error!("error in RequestHandler: {:?}", error);
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

/// Reloads a stub from its `named.conf`, logging like `named`.
pub struct StubControl {
    dir: PathBuf,
    log: PathBuf,
    config: Arc<RwLock<StubConfig>>,
}

impl StubControl {
    async fn load(&self, done: &str) -> io::Result<()> {
        let contents = tokio::fs::read_to_string(self.dir.join(CONFIG_FILE))
            .await
            .unwrap_or_default();
        match parse_config(&contents) {
            Ok(config) => {
                *self.config.write().await = config;
                append_log(&self.log, &["reloading configuration succeeded", done]).await
            }
            Err(reason) => {
                let line = format!("loading configuration: failure: {reason}");
                append_log(&self.log, &[&line, "reloading configuration failed: failure"]).await
            }
        }
    }
}

#[async_trait::async_trait]
impl Control for StubControl {
    async fn run(&self, args: &[&str]) -> Result<ControlOutput, Error> {
        let output = match args {
            ["reconfig"] => {
                self.load("any newly configured zones are now loaded").await?;
                String::new()
            }
            ["reload"] => {
                self.load("all zones loaded").await?;
                "server reload successful\n".to_string()
            }
            ["status"] => "server is up and running\n".to_string(),
            _ => {
                return Ok(ControlOutput {
                    success: false,
                    output: format!("rndc: '{}' failed: unknown command\n", args.join(" ")),
                })
            }
        };
        Ok(ControlOutput {
            success: true,
            output,
        })
    }
}

/// A running stub server listening on UDP and TCP on the same loopback port.
pub struct StubServer {
    pub name: String,
    pub addr: SocketAddr,
    pub dir: PathBuf,
    pub log: PathBuf,
    config: Arc<RwLock<StubConfig>>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub async fn resolver(name: &str, root: &Path) -> io::Result<Self> {
        Self::start(name, root, Role::Resolver).await
    }

    pub async fn forwarder(name: &str, root: &Path, upstream: SocketAddr) -> io::Result<Self> {
        Self::start(name, root, Role::Forwarder { upstream }).await
    }

    async fn start(name: &str, root: &Path, role: Role) -> io::Result<Self> {
        let dir = root.join(name);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(format!("{CONFIG_FILE}.j2")), CONFIG_TEMPLATE).await?;
        tokio::fs::write(dir.join(CONFIG_FILE), "trust-anchor valid;\n").await?;
        let log = dir.join("named.run");
        append_log(&log, &["running"]).await?;

        let config = Arc::new(RwLock::new(StubConfig::default()));
        let handler = Handler {
            role,
            config: config.clone(),
            log: log.clone(),
        };
        let (udp, tcp) = bind_pair().await?;
        let addr = tcp.local_addr()?;
        let mut server = ServerFuture::new(handler);
        server.register_socket(udp);
        server.register_listener(tcp, Duration::from_secs(5));
        let task = tokio::spawn(async move {
            if let Err(err) = server.block_until_done().await {
                tracing::error!("stub server stopped: {err}");
            }
        });

        Ok(Self {
            name: name.to_string(),
            addr,
            dir,
            log,
            config,
            task,
        })
    }

    pub async fn anchor(&self) -> Anchor {
        self.config.read().await.anchor
    }

    /// Whether a forwarder currently relays to its upstream.
    pub async fn forwarding(&self) -> bool {
        self.config.read().await.forward
    }

    /// A handle controlling this stub, verifying reloads within a short window.
    pub fn handle(&self) -> ServerHandle {
        let control: DynControl = Arc::new(StubControl {
            dir: self.dir.clone(),
            log: self.log.clone(),
            config: self.config.clone(),
        });
        let policy = ReloadPolicy {
            timeout: Duration::from_secs(2),
            ..ReloadPolicy::default()
        };
        ServerHandle::new(&self.name, self.addr, &self.dir, &self.log, control)
            .with_reload_policy(policy)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn bind_pair() -> io::Result<(UdpSocket, TcpListener)> {
    for _ in 0..20 {
        let tcp = TcpListener::bind("127.0.0.1:0").await?;
        if let Ok(udp) = UdpSocket::bind(tcp.local_addr()?).await {
            return Ok((udp, tcp));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no loopback port free for both UDP and TCP",
    ))
}

/// Transport options suited to loopback stubs.
pub fn fast_transport() -> TransportOptions {
    TransportOptions {
        timeout: Duration::from_secs(3),
        attempts: 2,
        retry_delay: Duration::from_millis(100),
    }
}
