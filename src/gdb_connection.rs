//! The remote-serial-protocol server. Wraps up the state of the
//! debugger protocol so that a (mostly) stateless interface can be
//! offered to the rest of the tracer: `get_request` yields the next
//! actionable request, and each `reply_*`/`notify_*` consumes it.
//!
//! Only the non-stop subset is supported; all-stop mode beyond the
//! universally-usable requests is explicitly not.

use crate::gdb_register::GdbRegister;
use crate::kernel_metadata::signal_name;
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::registers::MAX_REG_SIZE_BYTES;
use crate::scoped_fd::ScopedFd;
use libc::pid_t;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{read, write};
use std::io::ErrorKind;
use std::net::TcpListener;
use std::os::unix::io::IntoRawFd;

const INTERRUPT_CHAR: u8 = 0x03;

pub type GdbThreadId = pid_t;

/// Watchpoint/breakpoint kinds, in the protocol's Z-packet numbering.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GdbWatchKind {
    SwBreak = 0,
    HwBreak = 1,
    WriteWatch = 2,
    ReadWatch = 3,
    AccessWatch = 4,
}

impl GdbWatchKind {
    fn from_packet_type(type_: u32) -> Option<GdbWatchKind> {
        match type_ {
            0 => Some(GdbWatchKind::SwBreak),
            1 => Some(GdbWatchKind::HwBreak),
            2 => Some(GdbWatchKind::WriteWatch),
            3 => Some(GdbWatchKind::ReadWatch),
            4 => Some(GdbWatchKind::AccessWatch),
            _ => None,
        }
    }
}

/// One parsed debugger request, with its payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GdbRequest {
    None,
    GetCurrentThread,
    GetOffsets {
        thread: GdbThreadId,
    },
    GetRegs {
        thread: GdbThreadId,
    },
    GetReg {
        thread: GdbThreadId,
        reg: u32,
    },
    GetMem {
        thread: GdbThreadId,
        addr: usize,
        len: usize,
    },
    GetStopReason {
        thread: GdbThreadId,
    },
    GetThreadList,
    GetIsThreadAlive {
        thread: GdbThreadId,
    },
    SetContinueThread {
        thread: GdbThreadId,
    },
    SetQueryThread {
        thread: GdbThreadId,
    },
    Continue {
        thread: GdbThreadId,
    },
    Step {
        thread: GdbThreadId,
    },
    Interrupt,
    SetWatch {
        kind: GdbWatchKind,
        addr: usize,
        len: usize,
    },
    RemoveWatch {
        kind: GdbWatchKind,
        addr: usize,
        len: usize,
    },
}

impl GdbRequest {
    pub fn is_resume(&self) -> bool {
        matches!(self, GdbRequest::Continue { .. } | GdbRequest::Step { .. })
    }

    fn needs_immediate_response(&self) -> bool {
        !matches!(
            self,
            GdbRequest::None | GdbRequest::Continue { .. } | GdbRequest::Step { .. }
        )
    }
}

/// A possibly-undefined register value. `size` says how many bytes of
/// `value` are valid, if any.
#[derive(Copy, Clone)]
pub struct GdbRegisterValue {
    pub name: GdbRegister,
    pub value: [u8; MAX_REG_SIZE_BYTES],
    pub defined: bool,
    pub size: usize,
}

pub struct GdbConnection {
    /// Current request to be processed.
    req: GdbRequest,
    /// Thread to be resumed.
    resume_thread: GdbThreadId,
    /// Thread for get/set requests.
    query_thread: GdbThreadId,
    /// True when the client has announced it can service symbol
    /// lookups.
    serving_symbol_lookups: bool,
    /// True when "no-ack mode" is enabled, in which we don't have to
    /// send ack packets back. This is a huge perf win.
    no_ack: bool,
    /// True once non-stop mode has been negotiated.
    non_stop: bool,
    sock_fd: ScopedFd,
    /// Buffered input from the client.
    inbuf: Vec<u8>,
    /// Index of the '#' character of the packet being parsed.
    packetend: usize,
    /// Buffered output for the client.
    outbuf: Vec<u8>,
}

/// Block until a debugger client connects to `addr`:`port`. When
/// `probe` is set and the port is taken or forbidden, keep
/// incrementing the port and retrying.
pub fn await_client_connection(addr: &str, port: u16, probe: bool) -> GdbConnection {
    let mut port = port;
    let listener = loop {
        match TcpListener::bind((addr, port)) {
            Ok(listener) => break listener,
            Err(e)
                if probe
                    && matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) =>
            {
                port = port.checked_add(1).unwrap_or_else(|| {
                    fatal!("Ran out of ports to probe");
                });
            }
            Err(_) => fatal!("Couldn't bind to port {}", port),
        }
    };
    eprintln!("(debug server listening on {}:{})", addr, port);

    // Block until the debugging client connects to us.
    let (stream, _client_addr) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(_) => fatal!("Failed to accept debugger connection"),
    };
    let sock_fd = ScopedFd::from_raw(stream.into_raw_fd());
    unsafe {
        let flags = libc::fcntl(sock_fd.as_raw(), libc::F_GETFD);
        if flags < 0 || libc::fcntl(sock_fd.as_raw(), libc::F_SETFD, flags | libc::FD_CLOEXEC) != 0
        {
            fatal!("Can't make client socket CLOEXEC");
        }
        if libc::fcntl(sock_fd.as_raw(), libc::F_SETFL, libc::O_NONBLOCK) != 0 {
            fatal!("Can't make client socket NONBLOCK");
        }
    }

    GdbConnection {
        req: GdbRequest::None,
        resume_thread: 0,
        query_thread: 0,
        serving_symbol_lookups: false,
        no_ack: false,
        non_stop: false,
        sock_fd,
        inbuf: Vec::new(),
        packetend: 0,
        outbuf: Vec::new(),
    }
}

/// Translate a linux signal number to the debugger's portable
/// numbering, per gdb's signals.def.
pub fn to_gdb_signum(sig: i32) -> i32 {
    if (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(&sig) {
        // GDB_SIGNAL_REALTIME_34 is numbered 46, hence this offset.
        return sig + 12;
    }
    match sig {
        0 => 0,
        libc::SIGHUP => 1,
        libc::SIGINT => 2,
        libc::SIGQUIT => 3,
        libc::SIGILL => 4,
        libc::SIGTRAP => 5,
        libc::SIGABRT => 6,
        libc::SIGBUS => 10,
        libc::SIGFPE => 8,
        libc::SIGKILL => 9,
        libc::SIGUSR1 => 30,
        libc::SIGSEGV => 11,
        libc::SIGUSR2 => 31,
        libc::SIGPIPE => 13,
        libc::SIGALRM => 14,
        libc::SIGTERM => 15,
        // gdb hasn't heard of SIGSTKFLT, so this is arbitrarily made
        // up. SIGDANGER just sounds cool.
        libc::SIGSTKFLT => 38,
        libc::SIGCHLD => 20,
        libc::SIGCONT => 19,
        libc::SIGSTOP => 17,
        libc::SIGTSTP => 18,
        libc::SIGTTIN => 21,
        libc::SIGTTOU => 22,
        libc::SIGURG => 16,
        libc::SIGXCPU => 24,
        libc::SIGXFSZ => 25,
        libc::SIGVTALRM => 26,
        libc::SIGPROF => 27,
        libc::SIGWINCH => 28,
        libc::SIGIO => 23,
        libc::SIGPWR => 32,
        libc::SIGSYS => 12,
        _ => fatal!("Unknown signal {}", signal_name(sig)),
    }
}

fn parse_hex_prefix(s: &str) -> (usize, &str) {
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or_else(|| s.len());
    let value = usize::from_str_radix(&s[..end], 16).unwrap_or(0);
    (value, &s[end..])
}

fn parse_threadid(s: &str) -> (GdbThreadId, &str) {
    let (value, rest) = parse_hex_prefix(s);
    (value as GdbThreadId, rest)
}

impl GdbConnection {
    // ---------- socket plumbing ----------

    /// Poll for data to or from the client, waiting `timeout_ms`. 0
    /// means "don't wait" and -1 means "wait forever". Returns true if
    /// data is ready by the end of the timeout.
    fn poll_socket(&self, events: PollFlags, timeout_ms: i32) -> bool {
        let mut pfd = [PollFd::new(self.sock_fd.as_raw(), events)];
        match poll(&mut pfd, timeout_ms) {
            Ok(ret) => ret > 0,
            Err(_) => fatal!("Polling debugger socket failed"),
        }
    }

    fn poll_incoming(&self, timeout_ms: i32) -> bool {
        self.poll_socket(PollFlags::POLLIN, timeout_ms)
    }

    fn poll_outgoing(&self, timeout_ms: i32) -> bool {
        self.poll_socket(PollFlags::POLLOUT, timeout_ms)
    }

    /// read() incoming data exactly one time, successfully. May block.
    fn read_data_once(&mut self) {
        // Wait until there's data instead of busy-looping on EAGAIN.
        self.poll_incoming(-1);
        let mut buf = [0u8; 4096];
        let nread = match read(self.sock_fd.as_raw(), &mut buf) {
            Ok(0) | Err(_) => fatal!("Error reading from debugger client"),
            Ok(nread) => nread,
        };
        self.inbuf.extend_from_slice(&buf[..nread]);
    }

    /// Send all pending output. May block.
    fn write_flush(&mut self) {
        let mut write_index = 0;
        while write_index < self.outbuf.len() {
            self.poll_outgoing(-1);
            match write(self.sock_fd.as_raw(), &self.outbuf[write_index..]) {
                Ok(nwritten) => write_index += nwritten,
                Err(_) => fatal!("Error writing to debugger client"),
            }
        }
        self.outbuf.clear();
    }

    fn write_data_raw(&mut self, data: &[u8]) {
        self.outbuf.extend_from_slice(data);
    }

    fn write_hex(&mut self, hex: usize) {
        self.write_data_raw(format!("{:02x}", hex).as_bytes());
    }

    fn write_packet_payload(&mut self, data: &[u8]) {
        let checksum: u8 = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        self.write_data_raw(data);
        self.write_data_raw(b"#");
        self.write_hex(checksum as usize);
    }

    fn write_packet(&mut self, data: &str) {
        self.write_data_raw(b"$");
        self.write_packet_payload(data.as_bytes());
    }

    fn write_async_packet(&mut self, data: &str) {
        self.write_data_raw(b"%");
        self.write_packet_payload(data.as_bytes());
    }

    fn write_hex_encoded_bytes(&mut self, data: &[u8]) {
        let mut buf = String::with_capacity(2 * data.len());
        for b in data {
            buf.push_str(&format!("{:02x}", b));
        }
        self.write_packet(&buf);
    }

    // ---------- packet framing ----------

    /// Consume bytes in the input buffer until start-of-packet ('$') or
    /// the interrupt character is seen. Does not block. Returns true if
    /// seen.
    fn skip_to_packet_start(&mut self) -> bool {
        let maybe_start = self
            .inbuf
            .iter()
            .position(|b| *b == b'$' || *b == INTERRUPT_CHAR);
        match maybe_start {
            None => {
                // Discard all read bytes, which nothing cares about.
                self.inbuf.clear();
                false
            }
            Some(start) => {
                self.inbuf.drain(..start);
                debug_assert!(self.inbuf[0] == b'$' || self.inbuf[0] == INTERRUPT_CHAR);
                true
            }
        }
    }

    /// True if there's a new packet to be read/processed (whether
    /// incomplete or not).
    fn sniff_packet(&mut self) -> bool {
        if self.skip_to_packet_start() {
            // A (possibly partial) packet has already been seen.
            return true;
        }
        self.poll_incoming(0)
    }

    /// Block until the sequence of bytes "[^$]*\$[^#]*#.*" has been
    /// read from the client fd. This is one (or more) packets.
    fn read_packet(&mut self) {
        // Read and discard bytes until start-of-packet.
        //
        // NB: "+/-" acks from the client are ignored. There's no sane
        // reason why a damaged packet would be sent over local TCP,
        // then a "-" retransmit request seen, and the bug that produced
        // the damage magically fixed by resending.
        while !self.skip_to_packet_start() {
            self.read_data_once();
        }

        if self.inbuf[0] == INTERRUPT_CHAR {
            // Interrupts are kind of an ugly duckling in the protocol.
            self.packetend = 1;
            return;
        }

        // Read until end-of-packet. The two checksum bytes that follow
        // the '#' are not validated: corruption over a local TCP link
        // is implausible, and re-requesting the packet wouldn't help.
        let mut checkedlen = 0;
        loop {
            match memchr::memchr(b'#', &self.inbuf[checkedlen..]) {
                Some(i) => {
                    self.packetend = checkedlen + i;
                    break;
                }
                None => {
                    checkedlen = self.inbuf.len();
                    self.read_data_once();
                }
            }
        }
        debug_assert!(self.inbuf[0] == b'$' && self.packetend < self.inbuf.len());

        // Acknowledge receipt of the packet.
        if !self.no_ack {
            self.write_data_raw(b"+");
            self.write_flush();
        }
    }

    fn consume_request(&mut self) {
        self.req = GdbRequest::None;
        self.write_flush();
    }

    // ---------- packet dispatch ----------

    /// Handle a 'q' query. Returns true if a request was generated for
    /// the target.
    fn query(&mut self, payload: &str) -> bool {
        let (name, args) = match payload.find(':') {
            Some(i) => (&payload[..i], &payload[i + 1..]),
            None => (payload, ""),
        };

        if name == "C" {
            log!(LogDebug, "client requests current thread ID");
            self.req = GdbRequest::GetCurrentThread;
            return true;
        }
        if name == "Attached" {
            log!(LogDebug, "client asks if this is a new or existing process");
            // Tell the client this is an existing process; it might be.
            self.write_packet("1");
            return false;
        }
        if name == "fThreadInfo" {
            log!(LogDebug, "client asks for thread list");
            self.req = GdbRequest::GetThreadList;
            return true;
        }
        if name == "sThreadInfo" {
            // End of list.
            self.write_packet("l");
            return false;
        }
        if name == "GetTLSAddr" {
            log!(LogDebug, "client asks for TLS addr");
            self.write_packet("");
            return false;
        }
        if name == "Offsets" {
            log!(LogDebug, "client asks for section offsets");
            self.req = GdbRequest::GetOffsets {
                thread: self.query_thread,
            };
            return true;
        }
        if name.starts_with('P') {
            // The docs say not to use this packet.
            self.write_packet("");
            return false;
        }
        if name == "Supported" {
            log!(LogDebug, "client supports {}", args);
            self.write_packet("QStartNoAckMode+;QNonStop+");
            return false;
        }
        if name == "Symbol" {
            log!(LogDebug, "client is ready for symbol lookups");
            self.serving_symbol_lookups = true;
            self.write_packet("OK");
            return false;
        }
        if name.starts_with("ThreadExtraInfo") {
            self.write_hex_encoded_bytes(b"retrace tracee");
            return false;
        }
        if name == "TStatus" {
            log!(LogDebug, "client asks for trace status");
            // The docs say to reply "T0" here, but that only invites
            // more trace queries. Pretend not to know what it's talking
            // about.
            self.write_packet("");
            return false;
        }

        log!(LogWarn, "Unhandled debugger query: q{}", name);
        self.write_packet("");
        false
    }

    /// Handle a 'Q' set. Returns true if a request was generated.
    fn set(&mut self, payload: &str) -> bool {
        let (name, args) = match payload.find(':') {
            Some(i) => (&payload[..i], &payload[i + 1..]),
            None => (payload, ""),
        };

        if name == "StartNoAckMode" {
            self.write_packet("OK");
            self.no_ack = true;
            return false;
        }
        if name == "NonStop" {
            if args != "1" {
                fatal!(
                    "client requests QNonStop:{}, but this stub only supports enabling non-stop",
                    args
                );
            }
            self.write_packet("OK");
            self.non_stop = true;
            return false;
        }

        log!(LogWarn, "Unhandled debugger set: Q{}({})", name, args);
        self.write_packet("");
        false
    }

    /// Handle a 'v' packet. Returns true if a request was generated.
    fn process_vpacket(&mut self, payload: &str) -> bool {
        let (name, args) = match payload.find(';') {
            Some(i) => (&payload[..i], &payload[i + 1..]),
            None => (payload, ""),
        };

        if name == "Cont" {
            let mut chars = args.chars();
            let cmd = chars.next().unwrap_or('\0');
            let rest = chars.as_str();
            let rest = rest.strip_prefix(':').unwrap_or(rest);

            match cmd {
                'C' | 'c' => {
                    if cmd == 'C' {
                        log!(LogWarn, "Ignoring request to deliver signal ({})", rest);
                    }
                    self.req = GdbRequest::Continue {
                        thread: self.resume_thread,
                    };
                    self.write_packet("OK");
                    return true;
                }
                's' => {
                    let thread = if rest.is_empty() {
                        self.resume_thread
                    } else {
                        parse_threadid(rest).0
                    };
                    self.req = GdbRequest::Step { thread };
                    self.write_packet("OK");
                    return true;
                }
                't' => {
                    let (thread, _) = parse_threadid(rest);
                    self.write_packet("OK");
                    // The thread is already stopped, or else this
                    // request couldn't have been processed.
                    self.send_stop_reply_packet(true, "Stop:", thread, 0);
                    return false;
                }
                _ => {
                    log!(LogWarn, "Unhandled vCont command {}({})", cmd, rest);
                    self.write_packet("");
                    return false;
                }
            }
        }

        if name == "Cont?" {
            log!(LogDebug, "client queries which continue commands we support");
            self.write_packet("vCont;c;C;s;S;t;");
            return false;
        }

        if name == "Stopped" {
            log!(LogDebug, "client ack'ing stopped notification");
            // Tracee threads can only stop after client resume
            // requests, so there can only be one un-ack'd stop
            // notification: the one sent in the async-stop packet.
            self.write_packet("OK");
            return false;
        }

        log!(LogWarn, "Unhandled debugger vpacket: v{}", name);
        self.write_packet("");
        false
    }

    /// Parse the packet in `inbuf[..packetend]`. Returns true if the
    /// target must do something to satisfy it; false if it was handled
    /// internally.
    fn process_packet(&mut self) -> bool {
        let interrupt = self.inbuf[0] == INTERRUPT_CHAR;
        let (request, payload) = if interrupt {
            (INTERRUPT_CHAR, String::new())
        } else {
            let payload = if self.packetend > 2 {
                String::from_utf8_lossy(&self.inbuf[2..self.packetend]).into_owned()
            } else {
                String::new()
            };
            (self.inbuf[1], payload)
        };
        log!(LogDebug, "raw request {}({})", request as char, payload);

        // These requests can be satisfied without knowing whether
        // non-stop mode has been requested yet.
        let ret = match request {
            b'D' => {
                log!(LogInfo, "debugger is detaching from us, exiting");
                self.write_packet("OK");
                self.write_flush();
                std::process::exit(0)
            }
            b'k' => {
                log!(LogInfo, "debugger requests kill, exiting");
                self.write_packet("OK");
                self.write_flush();
                std::process::exit(0)
            }
            b'H' => {
                let mut chars = payload.chars();
                let op = chars.next().unwrap_or('\0');
                let (thread, _) = parse_threadid(chars.as_str());
                log!(LogDebug, "debugger selecting {}", thread);
                self.req = if op == 'c' {
                    GdbRequest::SetContinueThread { thread }
                } else {
                    GdbRequest::SetQueryThread { thread }
                };
                Some(true)
            }
            b'q' => Some(self.query(&payload)),
            b'Q' => Some(self.set(&payload)),
            _ => None,
        };

        let ret = match ret {
            Some(ret) => ret,
            None => {
                if !self.non_stop {
                    fatal!(
                        "Request for {}({}) when in unsupported all-stop mode",
                        request as char,
                        payload
                    );
                }
                self.process_target_packet(request, &payload)
            }
        };

        // Erase the newly processed packet from the input buffer.
        self.inbuf.drain(..self.packetend);
        self.packetend = 0;

        // If the request was processed internally, consume it.
        if !ret {
            self.consume_request();
        }
        ret
    }

    /// The requests only valid once non-stop mode is on.
    fn process_target_packet(&mut self, request: u8, payload: &str) -> bool {
        match request {
            INTERRUPT_CHAR => {
                log!(LogDebug, "debugger requests interrupt");
                self.req = GdbRequest::Interrupt;
                true
            }
            b'g' => {
                log!(LogDebug, "debugger requests registers");
                self.req = GdbRequest::GetRegs {
                    thread: self.query_thread,
                };
                true
            }
            b'G' | b'P' | b'M' | b'X' => {
                // Writing registers or memory would cause replay to
                // diverge; refuse these and see how far the client
                // gets.
                self.write_packet("");
                false
            }
            b'm' => {
                let (addr, rest) = parse_hex_prefix(payload);
                let rest = rest.strip_prefix(',').unwrap_or(rest);
                let (len, _) = parse_hex_prefix(rest);
                log!(
                    LogDebug,
                    "debugger requests memory (addr={:#x}, len={})",
                    addr,
                    len
                );
                self.req = GdbRequest::GetMem {
                    thread: self.query_thread,
                    addr,
                    len,
                };
                true
            }
            b'p' => {
                let (reg, _) = parse_hex_prefix(payload);
                log!(LogDebug, "debugger requests register value ({})", reg);
                self.req = GdbRequest::GetReg {
                    thread: self.query_thread,
                    reg: reg as u32,
                };
                true
            }
            b'T' => {
                let (thread, _) = parse_threadid(payload);
                log!(LogDebug, "debugger wants to know if {} is alive", thread);
                self.req = GdbRequest::GetIsThreadAlive { thread };
                true
            }
            b'v' => self.process_vpacket(payload),
            b'z' | b'Z' => {
                let (type_, rest) = parse_hex_prefix(payload);
                let kind = match GdbWatchKind::from_packet_type(type_ as u32) {
                    Some(kind) => kind,
                    None => {
                        log!(LogWarn, "Unknown watch type {}", type_);
                        self.write_packet("");
                        return false;
                    }
                };
                let rest = rest.strip_prefix(',').unwrap_or(rest);
                let (addr, rest) = parse_hex_prefix(rest);
                let rest = rest.strip_prefix(',').unwrap_or(rest);
                let (len, _) = parse_hex_prefix(rest);
                log!(
                    LogDebug,
                    "debugger requests {} breakpoint (addr={:#x}, len={})",
                    if request == b'Z' { "set" } else { "remove" },
                    addr,
                    len
                );
                self.req = if request == b'Z' {
                    GdbRequest::SetWatch { kind, addr, len }
                } else {
                    GdbRequest::RemoveWatch { kind, addr, len }
                };
                true
            }
            b'?' => {
                log!(LogDebug, "debugger requests stop reason");
                self.req = GdbRequest::GetStopReason {
                    thread: self.query_thread,
                };
                true
            }
            _ => {
                log!(LogWarn, "Unhandled debugger request '{}'", request as char);
                // Play dumb and hope the client doesn't *really* need
                // this request.
                self.write_packet("");
                false
            }
        }
    }

    // ---------- the tracer-facing interface ----------

    /// Return the next actionable request. Blocks for a complete packet
    /// unless the outstanding request is a resume and no new input has
    /// arrived, in which case the resume is re-returned so the tracer
    /// keeps running the target.
    pub fn get_request(&mut self) -> GdbRequest {
        // Can't ask for the next request until the current one has been
        // satisfied, for requests that need an immediate response.
        debug_assert!(!self.req.needs_immediate_response());

        if !self.sniff_packet() && self.req.is_resume() {
            // There's no new request data available and the client has
            // already asked us to resume. Keep doing that.
            return self.req.clone();
        }

        loop {
            // There's either new request data, or nothing to do. Either
            // way, block until a complete packet has been read.
            self.read_packet();
            if self.process_packet() {
                // The packet couldn't be processed internally, so the
                // target has to do something.
                return self.req.clone();
            }
            // The packet was internal client details; nothing for the
            // target to do yet. Keep waiting.
        }
    }

    pub fn serving_symbol_lookups(&self) -> bool {
        self.serving_symbol_lookups
    }

    pub fn non_stop(&self) -> bool {
        self.non_stop
    }

    // ---------- notifications ----------

    fn send_stop_reply_packet(&mut self, async_: bool, prefix: &str, thread: GdbThreadId, sig: i32) {
        if sig >= 0 {
            let buf = format!("{}T{:02x}thread:{:02x};", prefix, to_gdb_signum(sig), thread);
            if async_ {
                self.write_async_packet(&buf);
            } else {
                self.write_packet(&buf);
            }
        } else {
            self.write_packet("E01");
        }
    }

    pub fn notify_exit_code(&mut self, code: i32) {
        debug_assert!(self.req.is_resume() || self.req == GdbRequest::Interrupt);
        self.write_packet(&format!("W{:02x}", code));
        self.consume_request();
    }

    pub fn notify_exit_signal(&mut self, sig: i32) {
        debug_assert!(self.req.is_resume() || self.req == GdbRequest::Interrupt);
        self.write_packet(&format!("X{:02x}", sig));
        self.consume_request();
    }

    /// Send an asynchronous stop notification for `thread`. Only legal
    /// in non-stop mode.
    pub fn notify_stop(&mut self, thread: GdbThreadId, sig: i32) {
        debug_assert!(self.non_stop);
        debug_assert!(self.req.is_resume() || self.req == GdbRequest::Interrupt);
        self.send_stop_reply_packet(true, "Stop:", thread, sig);
        self.consume_request();
    }

    // ---------- replies ----------

    pub fn reply_invalid_target(&mut self) {
        self.write_packet("E00");
        self.consume_request();
    }

    pub fn reply_get_current_thread(&mut self, thread: GdbThreadId) {
        debug_assert!(matches!(self.req, GdbRequest::GetCurrentThread));
        self.write_packet(&format!("QC{:02x}", thread));
        self.consume_request();
    }

    pub fn reply_get_is_thread_alive(&mut self, alive: bool) {
        debug_assert!(matches!(self.req, GdbRequest::GetIsThreadAlive { .. }));
        self.write_packet(if alive { "OK" } else { "E01" });
        self.consume_request();
    }

    pub fn reply_select_thread(&mut self, ok: bool) {
        debug_assert!(matches!(
            self.req,
            GdbRequest::SetContinueThread { .. } | GdbRequest::SetQueryThread { .. }
        ));
        match self.req.clone() {
            GdbRequest::SetContinueThread { thread } if ok => self.resume_thread = thread,
            GdbRequest::SetQueryThread { thread } if ok => self.query_thread = thread,
            _ => (),
        }
        self.write_packet(if ok { "OK" } else { "E01" });
        self.consume_request();
    }

    pub fn reply_get_mem(&mut self, mem: &[u8]) {
        let req_len = match self.req.clone() {
            GdbRequest::GetMem { len, .. } => len,
            _ => panic!("Pending request is not GetMem"),
        };
        debug_assert!(mem.len() <= req_len);
        if !mem.is_empty() {
            self.write_hex_encoded_bytes(mem);
        } else {
            self.write_packet("");
        }
        self.consume_request();
    }

    pub fn reply_get_offsets(&mut self) {
        debug_assert!(matches!(self.req, GdbRequest::GetOffsets { .. }));
        self.write_packet("");
        self.consume_request();
    }

    pub fn reply_get_reg(&mut self, value: GdbRegisterValue) {
        debug_assert!(matches!(self.req, GdbRequest::GetReg { .. }));
        let mut buf = String::new();
        print_reg(&value, &mut buf);
        self.write_packet(&buf);
        self.consume_request();
    }

    pub fn reply_get_regs(&mut self, file: &[GdbRegisterValue]) {
        debug_assert!(matches!(self.req, GdbRequest::GetRegs { .. }));
        let mut buf = String::new();
        for value in file {
            print_reg(value, &mut buf);
        }
        self.write_packet(&buf);
        self.consume_request();
    }

    pub fn reply_get_stop_reason(&mut self, which: GdbThreadId, sig: i32) {
        debug_assert!(matches!(self.req, GdbRequest::GetStopReason { .. }));
        self.send_stop_reply_packet(false, "", which, sig);
        self.consume_request();
    }

    pub fn reply_get_thread_list(&mut self, threads: &[GdbThreadId]) {
        debug_assert!(matches!(self.req, GdbRequest::GetThreadList));
        if threads.is_empty() {
            self.write_packet("l");
        } else {
            let list = threads
                .iter()
                .map(|t| format!("{:02x}", t))
                .collect::<Vec<String>>()
                .join(",");
            self.write_packet(&format!("m{}", list));
        }
        self.consume_request();
    }

    pub fn reply_watchpoint_request(&mut self, ok: bool) {
        debug_assert!(matches!(
            self.req,
            GdbRequest::SetWatch { .. } | GdbRequest::RemoveWatch { .. }
        ));
        self.write_packet(if ok { "OK" } else { "" });
        self.consume_request();
    }
}

/// Format `value` the way the client expects: two hex digits per byte
/// in the tracee's native byte order, or "xx" pairs when the register
/// value is undefined so the client can see partial state.
fn print_reg(value: &GdbRegisterValue, out: &mut String) {
    if value.defined {
        for byte in &value.value[..value.size] {
            out.push_str(&format!("{:02x}", byte));
        }
    } else {
        for _ in 0..value.size {
            out.push_str("xx");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb_register::{DREG_RAX, DREG_RIP};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    fn value_reg(name: crate::gdb_register::GdbRegister, bytes: &[u8]) -> GdbRegisterValue {
        let mut value = [0u8; MAX_REG_SIZE_BYTES];
        value[..bytes.len()].copy_from_slice(bytes);
        GdbRegisterValue {
            name,
            value,
            defined: true,
            size: bytes.len(),
        }
    }

    fn undefined_reg(name: crate::gdb_register::GdbRegister, size: usize) -> GdbRegisterValue {
        GdbRegisterValue {
            name,
            value: [0u8; MAX_REG_SIZE_BYTES],
            defined: false,
            size,
        }
    }

    /// Parse a `g`-reply payload back into (defined, bytes) per
    /// register of the given sizes.
    fn parse_reg_file(payload: &str, sizes: &[usize]) -> Vec<(bool, Vec<u8>)> {
        let mut out = Vec::new();
        let mut s = payload;
        for size in sizes {
            let (chunk, rest) = s.split_at(2 * size);
            s = rest;
            if chunk.starts_with("xx") {
                out.push((false, vec![]));
            } else {
                let bytes = (0..*size)
                    .map(|i| u8::from_str_radix(&chunk[2 * i..2 * i + 2], 16).unwrap())
                    .collect();
                out.push((true, bytes));
            }
        }
        out
    }

    #[test]
    fn register_serialization_round_trip() {
        let regs = [
            value_reg(DREG_RAX, &0x1234_5678_9abc_def0u64.to_le_bytes()),
            undefined_reg(DREG_RIP, 8),
        ];
        let mut buf = String::new();
        for r in &regs {
            print_reg(r, &mut buf);
        }
        assert_eq!(32, buf.len());
        let parsed = parse_reg_file(&buf, &[8, 8]);
        assert!(parsed[0].0);
        assert_eq!(0x1234_5678_9abc_def0u64.to_le_bytes().to_vec(), parsed[0].1);
        assert!(!parsed[1].0);
    }

    #[test]
    fn gdb_signal_mapping() {
        assert_eq!(5, to_gdb_signum(libc::SIGTRAP));
        assert_eq!(11, to_gdb_signum(libc::SIGSEGV));
        // STKFLT maps to the "danger" slot by convention.
        assert_eq!(38, to_gdb_signum(libc::SIGSTKFLT));
        assert_eq!(libc::SIGRTMIN() + 12, to_gdb_signum(libc::SIGRTMIN()));
        assert_eq!(0, to_gdb_signum(0));
    }

    fn read_reply(stream: &mut TcpStream, want_ack: bool) -> String {
        let mut got = Vec::new();
        let mut one = [0u8; 1];
        // Read "+$payload#cc" (or "$payload#cc" in no-ack mode).
        loop {
            stream.read_exact(&mut one).unwrap();
            got.push(one[0]);
            if one[0] == b'#' {
                let mut csum = [0u8; 2];
                stream.read_exact(&mut csum).unwrap();
                break;
            }
        }
        let start = got.iter().position(|b| *b == b'$' || *b == b'%').unwrap();
        if want_ack {
            assert_eq!(b'+', got[0]);
        }
        String::from_utf8_lossy(&got[start + 1..got.len() - 1]).into_owned()
    }

    fn send_packet(stream: &mut TcpStream, payload: &str) {
        let checksum: u8 = payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        let framed = format!("${}#{:02x}", payload, checksum);
        stream.write_all(framed.as_bytes()).unwrap();
    }

    /// A full non-stop negotiation and resume/stop cycle against a real
    /// socket: qSupported, QStartNoAckMode, QNonStop:1, vCont;c, an
    /// async stop notification, and its vStopped ack.
    #[test]
    fn non_stop_session() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();

            send_packet(&mut stream, "qSupported:multiprocess+");
            let reply = read_reply(&mut stream, true);
            assert!(reply.contains("QStartNoAckMode+;QNonStop+"));

            send_packet(&mut stream, "QStartNoAckMode");
            assert_eq!("OK", read_reply(&mut stream, true));

            // Ack mode is now off; no '+' prefixes below.
            send_packet(&mut stream, "QNonStop:1");
            assert_eq!("OK", read_reply(&mut stream, false));

            send_packet(&mut stream, "Hg0");
            assert_eq!("OK", read_reply(&mut stream, false));

            send_packet(&mut stream, "vCont;c");
            assert_eq!("OK", read_reply(&mut stream, false));

            // The stop notification arrives asynchronously with a '%'
            // prefix.
            let stop = read_reply(&mut stream, false);
            assert_eq!(format!("Stop:T{:02x}thread:2a;", 5), stop);

            send_packet(&mut stream, "vStopped");
            assert_eq!("OK", read_reply(&mut stream, false));
        });

        let (stream, _) = listener.accept().unwrap();
        let mut dbg = GdbConnection {
            req: GdbRequest::None,
            resume_thread: 0,
            query_thread: 0,
            serving_symbol_lookups: false,
            no_ack: false,
            non_stop: false,
            sock_fd: ScopedFd::from_raw(stream.into_raw_fd()),
            inbuf: Vec::new(),
            packetend: 0,
            outbuf: Vec::new(),
        };

        // qSupported / QStartNoAckMode / QNonStop / Hg are handled
        // internally; the first actionable request is the select.
        let req = dbg.get_request();
        assert_eq!(GdbRequest::SetQueryThread { thread: 0 }, req);
        dbg.reply_select_thread(true);
        assert!(dbg.non_stop());

        let req = dbg.get_request();
        assert_eq!(GdbRequest::Continue { thread: 0 }, req);

        // With no new input, the pending resume is re-returned.
        let req = dbg.get_request();
        assert_eq!(GdbRequest::Continue { thread: 0 }, req);

        // The tracer drove the target to a SIGTRAP stop on thread 42.
        dbg.notify_stop(42, libc::SIGTRAP);

        // vStopped is acked internally; the client then detaches, which
        // exits the process in production. Read requests until the
        // client closes; swallow the panic from the exit call by
        // processing only the vStopped here.
        let _ = dbg.sniff_packet();
        dbg.read_packet();
        assert!(!dbg.process_packet());

        client.join().unwrap();
    }

    #[test]
    fn memory_and_watch_packet_parsing() {
        let (mut dbg, mut stream) = connected_pair();
        dbg.non_stop = true;
        dbg.no_ack = true;

        send_packet(&mut stream, "m40a0,11");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(
            GdbRequest::GetMem {
                thread: 0,
                addr: 0x40a0,
                len: 0x11
            },
            dbg.req
        );
        dbg.reply_get_mem(&[0xde, 0xad]);
        assert_eq!("dead", read_reply(&mut stream, false));

        send_packet(&mut stream, "Z0,400123,1");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(
            GdbRequest::SetWatch {
                kind: GdbWatchKind::SwBreak,
                addr: 0x400123,
                len: 1
            },
            dbg.req
        );
        dbg.reply_watchpoint_request(true);
        assert_eq!("OK", read_reply(&mut stream, false));

        send_packet(&mut stream, "z4,7fff0000,8");
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(
            GdbRequest::RemoveWatch {
                kind: GdbWatchKind::AccessWatch,
                addr: 0x7fff0000,
                len: 8
            },
            dbg.req
        );
        dbg.reply_watchpoint_request(false);
        assert_eq!("", read_reply(&mut stream, false));

        // Memory writes are refused outright.
        send_packet(&mut stream, "M40a0,2:ffff");
        dbg.read_packet();
        assert!(!dbg.process_packet());
        assert_eq!("", read_reply(&mut stream, false));
    }

    #[test]
    fn interrupt_character_becomes_request() {
        let (mut dbg, mut stream) = connected_pair();
        dbg.non_stop = true;
        dbg.no_ack = true;

        stream.write_all(&[INTERRUPT_CHAR]).unwrap();
        dbg.read_packet();
        assert!(dbg.process_packet());
        assert_eq!(GdbRequest::Interrupt, dbg.req);
    }

    fn connected_pair() -> (GdbConnection, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (server, _) = listener.accept().unwrap();
        let dbg = GdbConnection {
            req: GdbRequest::None,
            resume_thread: 0,
            query_thread: 0,
            serving_symbol_lookups: false,
            no_ack: false,
            non_stop: false,
            sock_fd: ScopedFd::from_raw(server.into_raw_fd()),
            inbuf: Vec::new(),
            packetend: 0,
            outbuf: Vec::new(),
        };
        (dbg, stream)
    }
}
