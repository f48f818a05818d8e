use std::{
    cell::RefCell,
    collections::HashMap,
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    rc::Rc,
};
use bytes::Bytes;
use mio::Token;

use crate::{
    base::server::{Protocol, ServerCtl, StreamServer},
    common::ftp::{FtpLine, FtpParser},
    connection::SendTag,
    error::{AuthError, Result},
    reactor::Reactor,
};

pub const CAPABILITIES: [&str; 2] = ["PASV", "UTF8"];

// authenticate(user, pass) -> accepted. The backend behind it is not this
// crate's concern.
pub type AuthHook = Box<dyn Fn(&str, &str) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Ascii,
    Binary,
}

// Deferred data-channel work, flushed when the peer opens the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    List,
    Retr,
}

struct FtpSession {
    parser: FtpParser,
    cwd: String,
    username: String,
    password: String,
    mode: TransferMode,
    remaining: Option<Deferred>,
    retr_target: Option<String>,
    data: Option<DataChannel>,
}

impl FtpSession {
    fn new() -> Self {
        FtpSession {
            parser: FtpParser::new(),
            cwd: "/".to_string(),
            username: "anonymous".to_string(),
            password: "anonymous".to_string(),
            mode: TransferMode::Ascii,
            remaining: None,
            retr_target: None,
            data: None,
        }
    }
}

struct DataChannel {
    listener: Token,
    accepted: Option<Token>,
}

enum TagAction {
    ListDone(Token),
    RetrDone(Token),
}

pub struct FtpProtocol {
    base_path: PathBuf,
    host: String,
    auth: AuthHook,
    sessions: HashMap<Token, FtpSession>,
    // data listeners and data connections back to their command connection
    links: HashMap<Token, Token>,
    tags: HashMap<SendTag, TagAction>,
    next_tag: SendTag,
}

pub type FtpServer = StreamServer<FtpProtocol>;

// Binds an FTP server on the reactor and returns it with the bound address.
pub fn serve(
    reactor: &mut Reactor,
    addr: SocketAddr,
    protocol: FtpProtocol,
) -> Result<(Rc<RefCell<FtpServer>>, SocketAddr)> {
    let server = Rc::new(RefCell::new(StreamServer::new(protocol)));
    let local = StreamServer::serve(&server, reactor, addr)?;
    Ok((server, local))
}

impl FtpProtocol {

    pub fn new(base_path: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        FtpProtocol {
            base_path: base_path.into(),
            host: host.into(),
            auth: Box::new(|_, _| true),
            sessions: HashMap::new(),
            links: HashMap::new(),
            tags: HashMap::new(),
            next_tag: 0,
        }
    }

    pub fn with_auth(mut self, auth: AuthHook) -> Self {
        self.auth = auth;
        self
    }

    fn alloc_tag(&mut self, action: TagAction) -> SendTag {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.tags.insert(tag, action);
        tag
    }

    fn handle_command(&mut self, ctl: &mut ServerCtl, token: Token, line: FtpLine) -> Result<()> {
        let verb = line.code.to_ascii_lowercase();
        let args = line.message;
        tracing::debug!("ftp < {} {}", verb, args);

        match verb.as_str() {
            "user" => {
                if let Some(session) = self.sessions.get_mut(&token) {
                    session.username = args;
                }
                reply(ctl, token, 200, "ok")
            }
            "pass" => {
                let (user, pass) = match self.sessions.get_mut(&token) {
                    Some(session) => {
                        session.password = args;
                        (session.username.clone(), session.password.clone())
                    }
                    None => (String::new(), String::new()),
                };
                if (self.auth)(&user, &pass) {
                    reply(ctl, token, 200, "ok")
                } else {
                    tracing::warn!("{}", AuthError { user });
                    reply(ctl, token, 530, "not logged in")
                }
            }
            "syst" => reply(ctl, token, 215, concat!("netloom ", env!("CARGO_PKG_VERSION"))),
            "feat" => {
                let mut lines: Vec<&str> = CAPABILITIES.to_vec();
                lines.push("end");
                reply_lines(ctl, token, 211, "features", &lines)
            }
            "opts" => reply(ctl, token, 200, "ok"),
            "pwd" => {
                let cwd = self
                    .sessions
                    .get(&token)
                    .map(|s| s.cwd.clone())
                    .unwrap_or_else(|| "/".to_string());
                reply(ctl, token, 257, &format!("\"{}\"", cwd))
            }
            "type" => {
                if let Some(session) = self.sessions.get_mut(&token) {
                    session.mode = if args.eq_ignore_ascii_case("a") {
                        TransferMode::Ascii
                    } else {
                        TransferMode::Binary
                    };
                    tracing::debug!("transfer mode now {:?}", session.mode);
                }
                reply(ctl, token, 200, "ok")
            }
            "pasv" => self.start_passive(ctl, token),
            "port" => reply(ctl, token, 200, "ok"),
            "cwd" => {
                if let Some(session) = self.sessions.get_mut(&token) {
                    session.cwd = resolve_path(&session.cwd, &args);
                }
                reply(ctl, token, 200, "ok")
            }
            "cdup" => {
                if let Some(session) = self.sessions.get_mut(&token) {
                    session.cwd = resolve_path(&session.cwd, "..");
                }
                reply(ctl, token, 200, "ok")
            }
            "list" => {
                if let Some(session) = self.sessions.get_mut(&token) {
                    session.remaining = Some(Deferred::List);
                }
                self.flush_deferred(ctl, token)
            }
            "retr" => {
                if let Some(session) = self.sessions.get_mut(&token) {
                    session.remaining = Some(Deferred::Retr);
                    session.retr_target = Some(args);
                }
                self.flush_deferred(ctl, token)
            }
            _ => reply(ctl, token, 502, "command not implemented"),
        }
    }

    // At most one data server per command connection: a second PASV closes
    // and replaces the first.
    fn start_passive(&mut self, ctl: &mut ServerCtl, token: Token) -> Result<()> {
        self.close_data(ctl, token);

        let ip = ctl
            .conns
            .get_mut(token)
            .and_then(|conn| conn.local_addr().ok())
            .map(|addr| addr.ip())
            .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]));
        let (listener, local) = ctl.open_sub(SocketAddr::new(ip, 0))?;
        self.links.insert(listener, token);
        if let Some(session) = self.sessions.get_mut(&token) {
            session.data = Some(DataChannel { listener, accepted: None });
        }

        let octets = match local.ip() {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(_) => [127, 0, 0, 1],
        };
        let address = format!(
            "{},{},{},{},{},{}",
            octets[0],
            octets[1],
            octets[2],
            octets[3],
            local.port() >> 8,
            local.port() & 0xff,
        );
        reply(ctl, token, 227, &format!("entered passive mode ({})", address))
    }

    // Deferred LIST/RETR runs once both sides are ready: the verb has been
    // seen and the peer has opened the data channel.
    fn flush_deferred(&mut self, ctl: &mut ServerCtl, token: Token) -> Result<()> {
        let (deferred, data_conn) = match self.sessions.get_mut(&token) {
            Some(session) => {
                let ready = session.data.as_ref().and_then(|chan| chan.accepted);
                match (session.remaining, ready) {
                    (Some(deferred), Some(conn)) => {
                        session.remaining = None;
                        (deferred, conn)
                    }
                    _ => return Ok(()),
                }
            }
            None => return Ok(()),
        };
        match deferred {
            Deferred::List => self.flush_list(ctl, token, data_conn),
            Deferred::Retr => self.flush_retr(ctl, token, data_conn),
        }
    }

    fn flush_list(&mut self, ctl: &mut ServerCtl, token: Token, data_conn: Token) -> Result<()> {
        reply(ctl, token, 150, "directory list sending")?;
        let listing = self.listing(token);
        let tag = self.alloc_tag(TagAction::ListDone(token));
        ctl.send_tagged(data_conn, listing.into_bytes(), false, Some(tag))
    }

    fn flush_retr(&mut self, ctl: &mut ServerCtl, token: Token, data_conn: Token) -> Result<()> {
        let (cwd, target) = match self.sessions.get(&token) {
            Some(session) => (session.cwd.clone(), session.retr_target.clone()),
            None => return Ok(()),
        };
        let target = match target {
            Some(name) if !name.is_empty() => name,
            _ => {
                self.close_data(ctl, token);
                return reply(ctl, token, 550, "failed to open file");
            }
        };
        let full = join_base(&self.base_path, &resolve_path(&cwd, &target));
        match fs::read(&full) {
            Ok(contents) => {
                reply(ctl, token, 150, "file sending")?;
                let tag = self.alloc_tag(TagAction::RetrDone(token));
                ctl.send_tagged(data_conn, contents, false, Some(tag))
            }
            Err(e) => {
                tracing::warn!("retr {:?} failed: {}", full, e);
                self.close_data(ctl, token);
                reply(ctl, token, 550, "failed to open file")
            }
        }
    }

    fn listing(&self, token: Token) -> String {
        let cwd = self
            .sessions
            .get(&token)
            .map(|s| s.cwd.clone())
            .unwrap_or_else(|| "/".to_string());
        let full = join_base(&self.base_path, &cwd);
        let mut out = String::new();
        match fs::read_dir(&full) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let (size, is_dir) = entry
                        .metadata()
                        .map(|meta| (meta.len(), meta.is_dir()))
                        .unwrap_or((0, false));
                    let perms = if is_dir { "drwxr--r--" } else { "-rwxr--r--" };
                    out.push_str(&format!(
                        "{}    1 {:<8} {:<8} {:>8} Apr  1  2014 {}\r\n",
                        perms, "owner", "group", size, name,
                    ));
                }
            }
            Err(e) => tracing::warn!("list {:?} failed: {}", full, e),
        }
        out
    }

    fn close_data(&mut self, ctl: &mut ServerCtl, token: Token) {
        if let Some(channel) = self.sessions.get_mut(&token).and_then(|s| s.data.take()) {
            self.teardown_channel(ctl, channel);
        }
    }

    fn teardown_channel(&mut self, ctl: &mut ServerCtl, channel: DataChannel) {
        self.links.remove(&channel.listener);
        ctl.close_sub(channel.listener);
        if let Some(conn) = channel.accepted {
            self.links.remove(&conn);
            let _ = ctl.close(conn);
        }
    }
}

impl Protocol for FtpProtocol {

    fn on_open(&mut self, ctl: &mut ServerCtl, token: Token) -> Result<()> {
        self.sessions.insert(token, FtpSession::new());
        let greeting = format!("{} ftp server ready", self.host);
        reply(ctl, token, 220, &greeting)
    }

    fn on_data(&mut self, ctl: &mut ServerCtl, token: Token, data: Bytes) -> Result<()> {
        // bytes on a data channel (uploads) are not a supported direction
        if self.links.contains_key(&token) {
            return Ok(());
        }
        let lines = match self.sessions.get_mut(&token) {
            Some(session) => {
                session.parser.parse(&data)?;
                session.parser.take_lines()
            }
            None => return Ok(()),
        };
        for line in lines {
            self.handle_command(ctl, token, line)?;
        }
        Ok(())
    }

    fn on_flush(&mut self, ctl: &mut ServerCtl, _token: Token, tag: SendTag) -> Result<()> {
        match self.tags.remove(&tag) {
            Some(TagAction::ListDone(cmd)) => {
                self.close_data(ctl, cmd);
                reply(ctl, cmd, 226, "directory send ok")
            }
            Some(TagAction::RetrDone(cmd)) => {
                self.close_data(ctl, cmd);
                reply(ctl, cmd, 226, "file send ok")
            }
            None => Ok(()),
        }
    }

    fn on_sub_accept(&mut self, ctl: &mut ServerCtl, listener: Token, conn: Token) -> Result<()> {
        let cmd = match self.links.get(&listener).copied() {
            Some(cmd) => cmd,
            None => return ctl.close(conn),
        };
        let mut claimed = false;
        if let Some(channel) = self
            .sessions
            .get_mut(&cmd)
            .and_then(|s| s.data.as_mut())
            .filter(|chan| chan.listener == listener)
        {
            if channel.accepted.is_none() {
                channel.accepted = Some(conn);
                claimed = true;
            }
        }
        if claimed {
            self.links.insert(conn, cmd);
            return self.flush_deferred(ctl, cmd);
        }
        // only the first data peer counts, extras are closed
        ctl.close(conn)
    }

    fn on_close(&mut self, ctl: &mut ServerCtl, token: Token, cancelled: Vec<SendTag>) {
        for tag in cancelled {
            self.tags.remove(&tag);
        }
        if let Some(cmd) = self.links.remove(&token) {
            // a data connection went away on its own
            if let Some(session) = self.sessions.get_mut(&cmd) {
                if session.data.as_ref().map_or(false, |c| c.accepted == Some(token)) {
                    if let Some(channel) = session.data.take() {
                        self.links.remove(&channel.listener);
                        ctl.close_sub(channel.listener);
                    }
                }
            }
            return;
        }
        if let Some(mut session) = self.sessions.remove(&token) {
            session.parser.destroy();
            if let Some(channel) = session.data.take() {
                self.teardown_channel(ctl, channel);
            }
        }
    }
}

fn reply(ctl: &mut ServerCtl, token: Token, code: u16, message: &str) -> Result<()> {
    tracing::debug!("ftp > {} {}", code, message);
    ctl.send(token, format!("{} {}\r\n", code, message).into_bytes())
}

// Multi-line reply: NNN-first, space-indented body lines, NNN last.
fn reply_lines(ctl: &mut ServerCtl, token: Token, code: u16, message: &str, lines: &[&str]) -> Result<()> {
    let (tail, body) = match lines.split_last() {
        Some(split) => split,
        None => return reply(ctl, token, code, message),
    };
    let mut out = format!("{}-{}\r\n", code, message);
    for line in body {
        out.push_str(&format!(" {}\r\n", line));
    }
    out.push_str(&format!("{} {}\r\n", code, tail));
    tracing::debug!("ftp > {}-{}", code, message);
    ctl.send(token, out.into_bytes())
}

// Logical path resolution against the session cwd; never touches the fs.
fn resolve_path(cwd: &str, arg: &str) -> String {
    let base = if arg.starts_with('/') { "/" } else { cwd };
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for segment in arg.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

fn join_base(base: &Path, logical: &str) -> PathBuf {
    base.join(logical.trim_start_matches('/'))
}
