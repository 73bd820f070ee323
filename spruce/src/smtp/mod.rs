//! # SMTP transport
//!
//! A state machine over a line-oriented stream: connect, EHLO/HELO
//! capability negotiation, STARTTLS upgrade, SASL authentication, and
//! the MAIL/RCPT/DATA envelope protocol with ESMTP extension
//! handling. Every command runs under its own timeout; failures
//! surface as [`Error::Protocol`] with the decoded reply text.

pub mod data;
pub mod response;
pub mod sasl;

use std::{
    net::IpAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    session::{PasswdFlags, Session},
    tls,
    transport::Transport,
    url::ServiceUrl,
};

#[doc(inline)]
pub use self::response::{EnhancedStatus, Response};
use self::{
    response::{parse_line, ResponseLine},
    sasl::Credentials,
};

const MAX_LINE_LEN: usize = 4096;

/// Cap on the PTR lookup of the local address; the numeric fallback
/// is always available.
const REVERSE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort reverse DNS of the connected socket's local address.
async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    // loopback never carries a PTR worth announcing
    if ip.is_loopback() {
        return None;
    }

    static RESOLVER: OnceLock<TokioAsyncResolver> = OnceLock::new();
    let resolver = RESOLVER.get_or_init(|| {
        TokioAsyncResolver::tokio_from_system_conf()
            .unwrap_or_else(|_| TokioAsyncResolver::tokio(Default::default(), Default::default()))
    });

    let lookup = timeout(REVERSE_LOOKUP_TIMEOUT, resolver.reverse_lookup(ip))
        .await
        .ok()?
        .ok()?;
    let name = lookup.iter().next()?.0.to_string();

    Some(name.trim_end_matches('.').to_owned())
}

bitflags::bitflags! {
    /// Capability bits maintained per connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SmtpCaps: u32 {
        /// EHLO succeeded; the peer speaks ESMTP.
        const IS_ESMTP              = 1 << 0;
        const EIGHT_BIT_MIME        = 1 << 1;
        const ENHANCED_STATUS_CODES = 1 << 2;
        const STARTTLS              = 1 << 3;
        /// The mechanism list came from the broken `AUTH=` form.
        const AUTH_EQUAL            = 1 << 4;
    }
}

/// Per-command client timeouts.
#[derive(Debug, Clone, Copy)]
pub struct SmtpTimeouts {
    pub connect: Duration,
    pub greeting: Duration,
    pub ehlo: Duration,
    pub starttls: Duration,
    pub auth: Duration,
    pub mail_from: Duration,
    pub rcpt_to: Duration,
    pub data: Duration,
    pub data_dot: Duration,
    pub rset: Duration,
    pub quit: Duration,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        let long = Duration::from_secs(300);
        Self {
            connect: Duration::from_secs(60),
            greeting: long,
            ehlo: long,
            starttls: Duration::from_secs(60),
            auth: Duration::from_secs(60),
            mail_from: long,
            rcpt_to: long,
            data: long,
            data_dot: long,
            rset: Duration::from_secs(30),
            quit: Duration::from_secs(10),
        }
    }
}

enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl SmtpStream {
    async fn read_buf(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SmtpStream::Plain(stream) => stream.read(buf).await,
            SmtpStream::Tls(stream) => stream.read(buf).await,
        }
    }

    async fn write_all_buf(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            SmtpStream::Plain(stream) => stream.write_all(buf).await,
            SmtpStream::Tls(stream) => stream.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SmtpStream::Plain(stream) => AsyncWriteExt::flush(stream).await,
            SmtpStream::Tls(stream) => AsyncWriteExt::flush(stream).await,
        }
    }
}

pub struct SmtpTransport {
    url: ServiceUrl,
    session: Arc<dyn Session>,
    timeouts: SmtpTimeouts,

    stream: Option<SmtpStream>,
    read_buffer: Vec<u8>,

    caps: SmtpCaps,
    /// Advertised AUTH mechanisms, uppercased.
    auth_types: Vec<String>,
    /// The EHLO/HELO argument for this connection.
    local_name: String,
}

impl SmtpTransport {
    pub fn new(url: ServiceUrl, session: Arc<dyn Session>) -> Self {
        Self {
            url,
            session,
            timeouts: SmtpTimeouts::default(),
            stream: None,
            read_buffer: Vec::with_capacity(1024),
            caps: SmtpCaps::empty(),
            auth_types: Vec::new(),
            local_name: "localhost.localdomain".into(),
        }
    }

    pub fn set_timeouts(&mut self, timeouts: SmtpTimeouts) {
        self.timeouts = timeouts;
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn capabilities(&self) -> SmtpCaps {
        self.caps
    }

    /// The AUTH mechanisms the server advertised.
    pub fn auth_types(&self) -> &[String] {
        &self.auth_types
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.read_buffer.clear();
    }

    async fn read_line(&mut self, deadline: Duration) -> Result<String> {
        loop {
            if let Some(i) = self.read_buffer.iter().position(|&b| b == b'\n') {
                if i > MAX_LINE_LEN {
                    self.drop_connection();
                    return Err(Error::protocol(0, "response line too long".to_owned()));
                }

                let mut line: Vec<u8> = self.read_buffer.drain(..=i).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                return String::from_utf8(line)
                    .map_err(|_| Error::protocol(0, "response is not UTF-8".to_owned()));
            }

            if self.read_buffer.len() > MAX_LINE_LEN {
                self.drop_connection();
                return Err(Error::protocol(0, "response line too long".to_owned()));
            }

            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            let mut chunk = [0u8; 1024];
            let n = match timeout(deadline, stream.read_buf(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    self.drop_connection();
                    return Err(err.into());
                }
                Err(_) => {
                    self.drop_connection();
                    return Err(Error::Timeout);
                }
            };

            if n == 0 {
                self.drop_connection();
                return Err(Error::ServiceUnavailable(
                    "connection closed by peer".into(),
                ));
            }

            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read a complete (possibly multiline) reply. Lines continue
    /// while the separator is `-`; every line of a reply carries the
    /// same code.
    async fn read_response(&mut self, deadline: Duration) -> Result<Response> {
        let mut lines: Vec<ResponseLine> = Vec::new();

        loop {
            let raw = self.read_line(deadline).await?;
            trace!("recv: {raw}");
            let line = parse_line(&raw)?;

            if let Some(first) = lines.first() {
                if line.code != first.code {
                    self.drop_connection();
                    return Err(Error::protocol(
                        first.code,
                        format!("mixed codes in multiline response: {raw}"),
                    ));
                }
            }

            let is_final = line.is_final;
            lines.push(line);
            if is_final {
                break;
            }
        }

        Ok(Response::assemble(
            &lines,
            self.caps.contains(SmtpCaps::ENHANCED_STATUS_CODES),
        ))
    }

    async fn write_line(&mut self, line: &str, deadline: Duration) -> Result<()> {
        trace!("send: {line}");
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");

        match timeout(deadline, async {
            stream.write_all_buf(&bytes).await?;
            stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.drop_connection();
                Err(err.into())
            }
            Err(_) => {
                self.drop_connection();
                Err(Error::Timeout)
            }
        }
    }

    async fn send_command(&mut self, line: &str, deadline: Duration) -> Result<Response> {
        self.write_line(line, deadline).await?;
        self.read_response(deadline).await
    }

    /// Derive the EHLO argument from the connected socket's local
    /// address: the reverse DNS name when one resolves, else the
    /// bracketed numeric literal (`IPv6:`-prefixed for v6), else
    /// `localhost.localdomain`.
    async fn discover_local_name(&mut self) {
        let addr = match self.stream.as_ref() {
            Some(SmtpStream::Plain(stream)) => stream.local_addr().ok(),
            Some(SmtpStream::Tls(stream)) => stream.get_ref().0.local_addr().ok(),
            None => None,
        };

        self.local_name = match addr {
            Some(addr) => match reverse_lookup(addr.ip()).await {
                Some(name) => name,
                None => match addr {
                    std::net::SocketAddr::V4(addr) => format!("[{}]", addr.ip()),
                    std::net::SocketAddr::V6(addr) => format!("[IPv6:{}]", addr.ip()),
                },
            },
            None => "localhost.localdomain".into(),
        };
    }

    /// Say hello: EHLO with a HELO fallback. The connection counts as
    /// ESMTP only when EHLO itself succeeded.
    async fn helo(&mut self) -> Result<()> {
        // clear the extension bits, keep only the ESMTP marker
        self.caps &= SmtpCaps::IS_ESMTP;
        self.auth_types.clear();

        self.caps |= SmtpCaps::IS_ESMTP;
        let ehlo = format!("EHLO {}", self.local_name);
        match self.send_command(&ehlo, self.timeouts.ehlo).await {
            Ok(response) if response.code == 250 => {
                self.parse_extensions(&response);
                return Ok(());
            }
            Ok(response) => {
                debug!("EHLO rejected ({}), falling back to HELO", response.code);
            }
            Err(err) if err.is_disconnect() => return Err(err),
            Err(err) => {
                debug!("EHLO failed ({err}), falling back to HELO");
            }
        }

        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }

        self.caps.remove(SmtpCaps::IS_ESMTP);
        let helo = format!("HELO {}", self.local_name);
        let response = self.send_command(&helo, self.timeouts.ehlo).await?;
        if response.code != 250 {
            return Err(response.into_error());
        }

        Ok(())
    }

    /// Decode the 250-extension lines of an EHLO reply.
    fn parse_extensions(&mut self, response: &Response) {
        for line in response.text.lines().skip(1) {
            let upper = line.to_ascii_uppercase();

            if upper == "8BITMIME" {
                self.caps |= SmtpCaps::EIGHT_BIT_MIME;
            } else if upper == "ENHANCEDSTATUSCODES" {
                self.caps |= SmtpCaps::ENHANCED_STATUS_CODES;
            } else if upper == "STARTTLS" {
                self.caps |= SmtpCaps::STARTTLS;
            } else if let Some(rest) = upper.strip_prefix("AUTH") {
                if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('=') {
                    continue;
                }

                // Some servers advertise AUTH twice: once standard,
                // once in the broken `AUTH=` form Outlook wants. Any
                // list may arrive first, but the standard spelling
                // wins.
                let broken = rest.starts_with('=');
                if !self.auth_types.is_empty() && !self.caps.contains(SmtpCaps::AUTH_EQUAL) {
                    continue;
                }
                self.caps.set(SmtpCaps::AUTH_EQUAL, broken);

                self.auth_types = rest
                    .trim_start_matches('=')
                    .split_whitespace()
                    .map(str::to_owned)
                    .collect();
            }
        }
    }

    async fn starttls_upgrade(&mut self) -> Result<()> {
        if !self.caps.contains(SmtpCaps::STARTTLS) {
            self.drop_connection();
            return Err(Error::ServiceUnavailable(
                "server does not appear to support STARTTLS".into(),
            ));
        }

        let response = self.send_command("STARTTLS", self.timeouts.starttls).await?;
        if response.code != 220 {
            return Err(response.into_error());
        }

        let host = self
            .url
            .host()
            .ok_or_else(|| Error::ServiceUnavailable("SMTP URL has no host".into()))?
            .to_owned();

        let tcp = match self.stream.take() {
            Some(SmtpStream::Plain(stream)) => stream,
            Some(other) => {
                self.stream = Some(other);
                return Err(Error::ServiceUnavailable(
                    "connection is already secured".into(),
                ));
            }
            None => return Err(Error::NotConnected),
        };
        self.read_buffer.clear();

        let secured = timeout(self.timeouts.starttls, tls::handshake(&host, tcp))
            .await
            .map_err(|_| Error::Timeout)??;
        self.stream = Some(SmtpStream::Tls(Box::new(secured)));

        // the extension set may differ on the secured channel
        self.helo().await
    }

    /// One AUTH exchange with a fresh mechanism instance.
    async fn auth_attempt(&mut self, mech_name: &str, creds: &Credentials) -> Result<()> {
        let mut mech = sasl::for_name(mech_name).ok_or_else(|| {
            Error::CannotAuthenticate(format!(
                "no support for the {mech_name} authentication mechanism"
            ))
        })?;

        let command = match mech.respond(None, creds)? {
            Some(initial) => format!("AUTH {} {initial}", mech.name()),
            None => format!("AUTH {}", mech.name()),
        };
        let mut response = self.send_command(&command, self.timeouts.auth).await?;

        loop {
            match response.code {
                235 => return Ok(()),
                334 if mech.authenticated() => {
                    // broken server: a 334 after a complete exchange
                    // is an idempotent ready-indicator
                    warn!("server sent 334 after a complete {mech_name} exchange");
                    return Ok(());
                }
                334 => {
                    let challenge =
                        sasl::decode_challenge(response.text.lines().next().unwrap_or_default())?;
                    match mech.respond(Some(&challenge), creds) {
                        Ok(Some(reply)) => {
                            response = self.send_command(&reply, self.timeouts.auth).await?;
                        }
                        Ok(None) | Err(_) => {
                            // get the server out of continuation mode
                            let _ = self.send_command("*", self.timeouts.auth).await;
                            return Err(Error::CannotAuthenticate(
                                "bad authentication response from server".into(),
                            ));
                        }
                    }
                }
                _ => {
                    return Err(Error::CannotAuthenticate(
                        response.into_error().to_string(),
                    ))
                }
            }
        }
    }

    /// The credential loop: prompt, attempt, re-prompt with REPROMPT
    /// on failure. Mechanisms that need no password get exactly one
    /// attempt.
    async fn authenticate(&mut self, mech_name: &str) -> Result<()> {
        let mech_upper = mech_name.to_ascii_uppercase();
        if !self.auth_types.contains(&mech_upper) {
            self.disconnect_now(true).await;
            return Err(Error::CannotAuthenticate(format!(
                "server does not support the requested authentication mechanism {mech_name}"
            )));
        }

        let needs_password = match sasl::for_name(&mech_upper) {
            Some(mech) => mech.need_password(),
            None => {
                self.disconnect_now(true).await;
                return Err(Error::CannotAuthenticate(format!(
                    "no support for the {mech_name} authentication mechanism"
                )));
            }
        };

        let user = self.url.user().unwrap_or_default().to_owned();
        let key = self.url.service_key();

        if !needs_password {
            let creds = Credentials {
                user,
                secret: String::new(),
            };
            if let Err(err) = self.auth_attempt(&mech_upper, &creds).await {
                self.disconnect_now(true).await;
                return Err(err);
            }
            return Ok(());
        }

        let mut flags = PasswdFlags::empty();
        let mut last_error: Option<String> = None;

        loop {
            let prompt = match &last_error {
                Some(err) => format!(
                    "{err}\nPlease enter the SMTP password for {user} on host {}",
                    self.url.host().unwrap_or_default()
                ),
                None => format!(
                    "Please enter the SMTP password for {user} on host {}",
                    self.url.host().unwrap_or_default()
                ),
            };

            let secret = match self.session.request_passwd(&prompt, &key, flags) {
                Some(secret) => secret,
                None => {
                    self.disconnect_now(true).await;
                    return Err(Error::CannotAuthenticate("no password provided".into()));
                }
            };

            let creds = Credentials {
                user: user.clone(),
                secret,
            };
            match self.auth_attempt(&mech_upper, &creds).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_disconnect() => return Err(err),
                Err(err) => {
                    debug!("authentication attempt failed: {err}");
                    // the cached secret was wrong: discard and ask
                    // again
                    self.session.forget_passwd(&key);
                    flags |= PasswdFlags::REPROMPT;
                    last_error = Some(format!("Unable to authenticate to SMTP server: {err}"));
                }
            }
        }
    }

    async fn rset(&mut self) -> Result<()> {
        let response = self.send_command("RSET", self.timeouts.rset).await?;
        if response.code != 250 {
            return Err(response.into_error());
        }
        Ok(())
    }

    /// Return the connection to Ready after a failed envelope step;
    /// drop it when even RSET fails.
    async fn recover(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if let Err(err) = self.rset().await {
            debug!("RSET failed, dropping the connection: {err}");
            self.drop_connection();
        }
    }

    async fn disconnect_now(&mut self, clean: bool) {
        if clean && self.stream.is_some() {
            match self.send_command("QUIT", self.timeouts.quit).await {
                Ok(response) if response.code == 221 => {}
                Ok(response) => debug!("QUIT rejected: {}", response.code),
                Err(err) => debug!("QUIT failed: {err}"),
            }
        }

        self.drop_connection();
        self.caps = SmtpCaps::empty();
        self.auth_types.clear();
    }

    /// Run the full connect sequence: TCP (or TLS for `smtps`),
    /// greeting, EHLO, optional STARTTLS upgrade, optional AUTH.
    pub async fn connect(&mut self) -> Result<()> {
        let host = self
            .url
            .host()
            .ok_or_else(|| Error::ServiceUnavailable("SMTP URL has no host".into()))?
            .to_owned();
        let implicit_tls = self.url.scheme() == "smtps";
        let port = self
            .url
            .port()
            .unwrap_or(if implicit_tls { 465 } else { 25 });

        self.caps = SmtpCaps::empty();
        self.auth_types.clear();
        self.read_buffer.clear();

        let tcp = timeout(self.timeouts.connect, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|err| {
                Error::ServiceUnavailable(format!("could not connect to {host}:{port}: {err}"))
            })?;
        tcp.set_nodelay(true)?;

        self.stream = Some(if implicit_tls {
            let secured = timeout(self.timeouts.connect, tls::handshake(&host, tcp))
                .await
                .map_err(|_| Error::Timeout)??;
            SmtpStream::Tls(Box::new(secured))
        } else {
            SmtpStream::Plain(tcp)
        });

        self.discover_local_name().await;

        let greeting = self.read_response(self.timeouts.greeting).await?;
        if greeting.code != 220 {
            self.drop_connection();
            return Err(greeting.into_error());
        }

        self.helo().await?;

        if self.url.starttls() && !implicit_tls {
            self.starttls_upgrade().await?;
        }

        if let Some(mech) = self.url.auth_mechanism().map(str::to_owned) {
            self.authenticate(&mech).await?;

            // we are supposed to re-EHLO after AUTH; some servers
            // dislike it, so errors are ignored unless we lost the
            // connection
            if let Err(err) = self.helo().await {
                if self.stream.is_none() {
                    return Err(err);
                }
                debug!("ignoring EHLO failure after AUTH: {err}");
            }
        }

        Ok(())
    }

    /// Send one message. The envelope is validated before any command
    /// goes out; any mid-envelope failure RSETs back to Ready.
    pub async fn send_message(
        &mut self,
        from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }

        if from.is_empty() {
            return Err(Error::InvalidSender("<>".into()));
        }
        if recipients.is_empty() {
            return Err(Error::InvalidRecipient("no recipients given".into()));
        }
        if recipients.iter().any(|addr| addr.is_empty()) {
            return Err(Error::InvalidRecipient("empty address".into()));
        }

        let allow_8bit = self.caps.contains(SmtpCaps::EIGHT_BIT_MIME);
        let prepared = data::prepare(message, allow_8bit);

        // 8BITMIME is only declared when the message actually needs
        // it
        let mail = if allow_8bit && data::has_8bit(&prepared) {
            format!("MAIL FROM:<{from}> BODY=8BITMIME")
        } else {
            format!("MAIL FROM:<{from}>")
        };

        let response = self.send_command(&mail, self.timeouts.mail_from).await?;
        if response.code != 250 {
            let err = response.into_error();
            self.recover().await;
            return Err(err);
        }

        for recipient in recipients {
            let rcpt = format!("RCPT TO:<{recipient}>");
            let response = self.send_command(&rcpt, self.timeouts.rcpt_to).await?;
            if response.code != 250 {
                let err = response.into_error();
                self.recover().await;
                return Err(err);
            }
        }

        let response = self.send_command("DATA", self.timeouts.data).await?;
        if response.code != 354 {
            let err = response.into_error();
            self.recover().await;
            return Err(err);
        }

        let stuffed = data::dot_stuff(&prepared);
        let write = async {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            stream.write_all_buf(&stuffed).await?;
            stream.write_all_buf(b".\r\n").await?;
            stream.flush().await?;
            Ok::<(), Error>(())
        };
        match timeout(self.timeouts.data, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.drop_connection();
                return Err(err);
            }
            Err(_) => {
                self.drop_connection();
                return Err(Error::Timeout);
            }
        }

        let response = self.read_response(self.timeouts.data_dot).await?;
        if response.code != 250 {
            let err = response.into_error();
            self.recover().await;
            return Err(err);
        }

        // reset the transaction state for the next send
        self.recover().await;

        Ok(())
    }

    pub async fn disconnect(&mut self, clean: bool) -> Result<()> {
        self.disconnect_now(clean).await;
        Ok(())
    }
}

impl Drop for SmtpTransport {
    fn drop(&mut self) {
        if self.stream.is_some() {
            debug!("SMTP transport dropped while connected");
        }
    }
}

/// The [`Transport`] wrapper handed out by the provider registry: one
/// SMTP connection behind an async mutex.
pub struct SmtpService {
    transport: tokio::sync::Mutex<SmtpTransport>,
}

impl SmtpService {
    pub fn new(url: ServiceUrl, session: Arc<dyn Session>) -> Arc<Self> {
        Arc::new(Self {
            transport: tokio::sync::Mutex::new(SmtpTransport::new(url, session)),
        })
    }

    /// Direct access for callers that need capability inspection.
    pub async fn with_transport<R>(&self, f: impl FnOnce(&mut SmtpTransport) -> R) -> R {
        let mut transport = self.transport.lock().await;
        f(&mut transport)
    }
}

#[async_trait]
impl Transport for SmtpService {
    async fn connect(&self) -> Result<()> {
        self.transport.lock().await.connect().await
    }

    async fn disconnect(&self, clean: bool) -> Result<()> {
        self.transport.lock().await.disconnect(clean).await
    }

    async fn send(&self, from: &str, recipients: &[String], message: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock().await;
        if !transport.is_connected() {
            transport.connect().await?;
        }
        transport.send_message(from, recipients, message).await
    }
}
