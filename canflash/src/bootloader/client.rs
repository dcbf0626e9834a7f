//! Bootloader client: handshake, request/response, discovery and
//! address assignment.
//!
//! Exactly one command is in flight at a time. Every send is followed by a
//! bounded wait on the reply window; unrelated frames seen during the wait
//! are discarded, since the bus is shared.
//!
//! ## Example
//!
//! ```rust,no_run
//! use canflash::{BootloaderClient, ProtocolConfig, SlcanPort};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = SlcanPort::open("/dev/ttyACM0", 500_000)?;
//!     let mut client = BootloaderClient::new(port, ProtocolConfig::default());
//!
//!     let boards = client.discover_default()?;
//!     println!("Boards on the bus: {boards:?}");
//!
//!     if client.connect(4)? {
//!         client.set_address(4, 12)?;
//!     }
//!     Ok(())
//! }
//! ```

use {
    crate::{
        error::{Error, Result},
        port::{CanBus, CanFrame},
        protocol::{
            BROADCAST_ADDRESS, Command, CommandFrame, MAX_ASSIGNABLE_ADDRESS, Response,
            matches_response,
        },
        target::ProtocolConfig,
    },
    log::{debug, info, trace, warn},
    std::{
        collections::BTreeSet,
        time::{Duration, Instant},
    },
};

/// Protocol state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Nothing sent yet.
    #[default]
    Idle,
    /// Handshake pings in progress.
    Connecting,
    /// Last exchange got a reply.
    Connected,
    /// A command was sent and its reply is pending.
    AwaitingReply,
    /// Last handshake or command got no reply at all.
    Failed,
}

/// Bootloader protocol client.
///
/// Generic over the bus adapter `P`. The client owns the adapter for the
/// lifetime of the session.
pub struct BootloaderClient<P: CanBus> {
    port: P,
    config: ProtocolConfig,
    state: ClientState,
}

impl<P: CanBus> BootloaderClient<P> {
    /// Create a client on an opened bus.
    pub fn new(port: P, config: ProtocolConfig) -> Self {
        Self {
            port,
            config,
            state: ClientState::Idle,
        }
    }

    /// Protocol configuration in use.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Current protocol state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Get a reference to the underlying bus.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying bus.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the client and return the underlying bus.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Ping `board` until it answers, using the configured handshake timing.
    pub fn connect(&mut self, board: u8) -> Result<bool> {
        self.wait_for_connection(board, self.config.connect_timeout, self.config.connect_tries)
    }

    /// Ping `board` up to `max_tries` times, waiting `timeout_per_try` each.
    ///
    /// Returns `Ok(false)` if no ping was answered; only a transport failure
    /// is an error. A reply with any status counts as connected.
    pub fn wait_for_connection(
        &mut self,
        board: u8,
        timeout_per_try: Duration,
        max_tries: u32,
    ) -> Result<bool> {
        self.state = ClientState::Connecting;
        let ping = CommandFrame::ping(board);

        for attempt in 1..=max_tries {
            trace!("Ping board {board} (attempt {attempt}/{max_tries})");
            self.send_command(&ping)?;
            if self.wait_reply(board, Command::Ping, timeout_per_try)?.is_some() {
                info!("Connected to board {board}");
                self.state = ClientState::Connected;
                return Ok(true);
            }
        }

        debug!("Board {board} did not answer {max_tries} pings");
        self.state = ClientState::Failed;
        Ok(false)
    }

    /// Send a command with the configured per-command timing.
    pub fn command(&mut self, board: u8, command: Command, param1: u16, param2: [u8; 4]) -> Result<u8> {
        self.command_response(
            board,
            command,
            param1,
            param2,
            self.config.command_timeout,
            self.config.command_tries,
        )
    }

    /// Send a command and wait for its reply, resending on silence.
    ///
    /// Up to `max_tries` attempts are made. A reply with a nonzero status
    /// fails immediately with [`Error::DeviceRejected`]; only silence is
    /// retried. Returns the status byte (always 0) on success.
    pub fn command_response(
        &mut self,
        board: u8,
        command: Command,
        param1: u16,
        param2: [u8; 4],
        timeout_per_try: Duration,
        max_tries: u32,
    ) -> Result<u8> {
        let frame = CommandFrame::new(board, command, param1, param2);

        for attempt in 1..=max_tries {
            self.state = ClientState::AwaitingReply;
            self.send_command(&frame)?;

            match self.wait_reply(board, command, timeout_per_try)? {
                Some(status) => {
                    self.state = ClientState::Connected;
                    return Self::check_status(board, command, status);
                },
                None => {
                    debug!("No reply to {command:?} from board {board} (attempt {attempt}/{max_tries})");
                },
            }
        }

        warn!("Board {board} never answered {command:?} after {max_tries} attempts");
        self.state = ClientState::Failed;
        Err(Error::NoReply { board, command })
    }

    /// Assign `new_address` to `board`.
    ///
    /// Validated before any bus traffic. Sent once; the device switches to
    /// its new address before acknowledging.
    pub fn set_address(&mut self, board: u8, new_address: u16) -> Result<()> {
        let new = u8::try_from(new_address)
            .ok()
            .filter(|&a| a <= MAX_ASSIGNABLE_ADDRESS)
            .ok_or(Error::InvalidAddress(new_address))?;

        info!("Changing board address {board} -> {new}");
        self.state = ClientState::AwaitingReply;
        self.send_command(&CommandFrame::new(board, Command::SetId, new_address, [0; 4]))?;

        // The acknowledgement comes from the NEW address, not `board`.
        // Waiting on `board` here would always time out.
        let status = self.wait_reply(new, Command::SetId, self.config.set_id_timeout)?;
        match status {
            Some(status) => {
                self.state = ClientState::Connected;
                Self::check_status(new, Command::SetId, status)?;
                Ok(())
            },
            None => {
                self.state = ClientState::Failed;
                Err(Error::NoReply {
                    board: new,
                    command: Command::SetId,
                })
            },
        }
    }

    /// Enumerate nodes with the configured discovery timing.
    pub fn discover_default(&mut self) -> Result<BTreeSet<u8>> {
        self.discover(self.config.discover_timeout, self.config.discover_tries)
    }

    /// Ping the broadcast address `max_tries` times and collect every board
    /// that answers within each `timeout_per_try` window.
    ///
    /// Best-effort: two nodes answering in the same instant may collide on
    /// the bus and one of them can be missed in that window.
    pub fn discover(&mut self, timeout_per_try: Duration, max_tries: u32) -> Result<BTreeSet<u8>> {
        let ping = CommandFrame::ping(BROADCAST_ADDRESS);
        let mut boards = BTreeSet::new();

        for attempt in 1..=max_tries {
            trace!("Discovery ping {attempt}/{max_tries}");
            self.send_command(&ping)?;

            let deadline = Instant::now() + timeout_per_try;
            while let Some(frame) = self.receive_until(deadline)? {
                if let Some(resp) = Response::parse(&frame, &self.config.reply_ids) {
                    if resp.command == Command::Ping.code() && boards.insert(resp.board) {
                        debug!("Discovered board {}", resp.board);
                    }
                }
            }
        }

        info!("Discovery found {} board(s)", boards.len());
        Ok(boards)
    }

    fn check_status(board: u8, command: Command, status: u8) -> Result<u8> {
        if status == 0 {
            Ok(status)
        } else {
            warn!("Board {board} rejected {command:?} with error #{status}");
            Err(Error::DeviceRejected {
                board,
                command,
                code: status,
            })
        }
    }

    /// Send a command frame on the command id.
    fn send_command(&mut self, frame: &CommandFrame) -> Result<()> {
        let can = CanFrame::new(self.config.command_id, &frame.build())?;
        trace!("TX {can}");
        self.port.send(&can, self.config.send_timeout)
    }

    /// Wait until `deadline` for the reply of `board` to `command`.
    ///
    /// Returns the status byte, or `None` if the window closed.
    fn wait_reply(&mut self, board: u8, command: Command, timeout: Duration) -> Result<Option<u8>> {
        let deadline = Instant::now() + timeout;
        while let Some(frame) = self.receive_until(deadline)? {
            if matches_response(&frame, &self.config.reply_ids, board, command) {
                return Ok(Some(frame.data()[2]));
            }
            trace!("Ignoring {frame}");
        }
        Ok(None)
    }

    /// Receive the next frame before `deadline`.
    fn receive_until(&mut self, deadline: Instant) -> Result<Option<CanFrame>> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if let Some(frame) = self.port.try_receive(remaining)? {
                trace!("RX {frame}");
                return Ok(Some(frame));
            }
        }
    }
}
