//! In-memory bus with simulated bootloader nodes, for tests.
//!
//! Each [`SimDevice`] behaves like the resident bootloader: it buffers
//! words, checks page CRCs over the buffered words, checks the whole-image
//! CRC over committed pages and adopts new addresses on `SetId`.

use {
    crate::{
        error::{Error, Result},
        port::{CanBus, CanFrame},
        protocol::{BROADCAST_ADDRESS, Command, CommandFrame, CrcEngine, Response},
        target::ProtocolConfig,
    },
    std::{collections::VecDeque, time::Duration},
};

/// Status codes used by the bootloader firmware.
pub(crate) const ERR_INVALID_PAGE_NUM: u8 = 1;
pub(crate) const ERR_INVALID_CRC: u8 = 2;
pub(crate) const ERR_INVALID_ID: u8 = 4;
pub(crate) const ERR_INVALID_OFFSET: u8 = 5;

/// Pages of application flash on the simulated part.
const FLASH_PAGES: usize = 52;

/// Test hook verdict for an incoming command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Handle normally.
    None,
    /// Answer with this status without touching device state.
    Reject(u8),
    /// Swallow the command without replying.
    Drop,
}

type FaultHook = Box<dyn FnMut(&CommandFrame) -> Fault + Send>;

/// One simulated bootloader node.
pub(crate) struct SimDevice {
    pub address: u8,
    page_buf: Vec<u32>,
    pub flash: Vec<Option<Vec<u32>>>,
    pub verified_pages: Option<u16>,
    fault: Option<FaultHook>,
}

impl SimDevice {
    pub fn new(address: u8, words_per_page: usize) -> Self {
        Self {
            address,
            page_buf: vec![0; words_per_page],
            flash: vec![None; FLASH_PAGES],
            verified_pages: None,
            fault: None,
        }
    }

    /// Install a hook deciding per command whether to misbehave.
    pub fn with_fault<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&CommandFrame) -> Fault + Send + 'static,
    {
        self.fault = Some(Box::new(hook));
        self
    }

    /// Handle a command; returns `(reply address, status)` if the node answers.
    fn handle(&mut self, cmd: &CommandFrame, crc: &CrcEngine) -> Option<(u8, u8)> {
        let addressed = cmd.board == self.address
            || (cmd.board == BROADCAST_ADDRESS && cmd.command == Command::Ping);
        if !addressed {
            return None;
        }

        if let Some(hook) = self.fault.as_mut() {
            match hook(cmd) {
                Fault::None => {},
                Fault::Reject(code) => return Some((self.address, code)),
                Fault::Drop => return None,
            }
        }

        let value = cmd.param2_value();
        let status = match cmd.command {
            Command::Ping => 0,
            Command::WriteBuffer => {
                match self.page_buf.get_mut(usize::from(cmd.param1)) {
                    Some(slot) => {
                        *slot = value;
                        0
                    },
                    None => ERR_INVALID_OFFSET,
                }
            },
            Command::WritePage => {
                let page = usize::from(cmd.param1);
                if page >= FLASH_PAGES {
                    ERR_INVALID_PAGE_NUM
                } else if Self::crc_of(crc, &self.page_buf) != value {
                    ERR_INVALID_CRC
                } else {
                    self.flash[page] = Some(self.page_buf.clone());
                    0
                }
            },
            Command::WriteCrc => {
                let pages = usize::from(cmd.param1);
                if pages > FLASH_PAGES {
                    ERR_INVALID_PAGE_NUM
                } else {
                    let mut acc = crc.accumulator();
                    for page in &self.flash[..pages] {
                        let words = page.clone().unwrap_or_else(|| vec![0xFFFF_FFFF; self.page_buf.len()]);
                        for word in words {
                            acc.update(word.to_be_bytes());
                        }
                    }
                    if acc.value() == value {
                        self.verified_pages = Some(cmd.param1);
                        0
                    } else {
                        ERR_INVALID_CRC
                    }
                }
            },
            Command::SetId => match u8::try_from(cmd.param1) {
                Ok(new) if new <= 254 => {
                    // Adopts the new address before acknowledging
                    self.address = new;
                    0
                },
                _ => ERR_INVALID_ID,
            },
        };
        Some((self.address, status))
    }

    fn crc_of(crc: &CrcEngine, words: &[u32]) -> u32 {
        crc.checksum_words(words.iter().map(|w| w.to_be_bytes()))
    }
}

/// Simulated bus carrying any number of bootloader nodes.
pub(crate) struct SimBus {
    pub devices: Vec<SimDevice>,
    pub sent: Vec<CommandFrame>,
    pub fail_send: bool,
    pub noise: bool,
    config: ProtocolConfig,
    crc: CrcEngine,
    inbox: VecDeque<CanFrame>,
}

impl SimBus {
    pub fn new(config: &ProtocolConfig, devices: Vec<SimDevice>) -> Self {
        Self {
            devices,
            sent: Vec::new(),
            fail_send: false,
            noise: false,
            config: config.clone(),
            crc: CrcEngine::new(config.crc),
            inbox: VecDeque::new(),
        }
    }

    /// Bus with one well-behaved node.
    pub fn single(config: &ProtocolConfig, address: u8) -> Self {
        Self::new(config, vec![SimDevice::new(address, config.words_per_page())])
    }

    /// Bus with nobody listening.
    pub fn silent(config: &ProtocolConfig) -> Self {
        Self::new(config, Vec::new())
    }

    /// Number of sent frames carrying `command`.
    pub fn count(&self, command: Command) -> usize {
        self.sent
            .iter()
            .filter(|f| f.command == command)
            .count()
    }

    /// Sent frames carrying `command`.
    pub fn sent_with(&self, command: Command) -> Vec<CommandFrame> {
        self.sent
            .iter()
            .filter(|f| f.command == command)
            .copied()
            .collect()
    }
}

impl CanBus for SimBus {
    fn send(&mut self, frame: &CanFrame, _timeout: Duration) -> Result<()> {
        if self.fail_send {
            return Err(Error::Transport("simulated send failure".into()));
        }
        if frame.id() != u32::from(self.config.command_id) {
            return Ok(());
        }
        let Some(cmd) = CommandFrame::decode(frame.data()) else {
            return Ok(());
        };
        self.sent.push(cmd);

        if self.noise {
            // Unrelated traffic and a reply on a foreign board
            self.inbox
                .push_back(CanFrame::new(0x123, &[cmd.board, cmd.command.code(), 0]).unwrap());
            self.inbox.push_back(
                CanFrame::new(
                    self.config.reply_ids.for_board(0),
                    &[cmd.board.wrapping_add(1), cmd.command.code(), 0],
                )
                .unwrap(),
            );
        }

        for device in &mut self.devices {
            if let Some((address, status)) = device.handle(&cmd, &self.crc) {
                let reply = Response {
                    board: address,
                    command: cmd.command.code(),
                    status,
                };
                self.inbox.push_back(
                    CanFrame::new(self.config.reply_ids.for_board(address), &reply.build()).unwrap(),
                );
            }
        }
        Ok(())
    }

    fn try_receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        if let Some(frame) = self.inbox.pop_front() {
            return Ok(Some(frame));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(None)
    }

    fn name(&self) -> &str {
        "sim"
    }
}
