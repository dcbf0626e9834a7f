//! Page-by-page firmware upload with dual-level CRC verification.
//!
//! Every page is sent word by word into the device's page buffer and then
//! committed with its CRC. A failure anywhere in a page restarts that page
//! from its first word. Once all pages are committed the whole-image CRC is
//! submitted for the device to check against what it actually stored.

use {
    crate::{
        bootloader::client::BootloaderClient,
        error::{Error, Result},
        image::FirmwareImage,
        port::CanBus,
        protocol::{Command, CrcAccumulator, CrcEngine},
    },
    log::{debug, info, warn},
};

/// Outcome of a successful flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashReport {
    /// Pages written and verified.
    pub page_count: usize,
    /// Whole-image CRC accepted by the device.
    pub image_crc: u32,
    /// Page attempts that had to be repeated.
    pub page_retries_used: u32,
}

/// Firmware flasher driving a [`BootloaderClient`].
pub struct Flasher<P: CanBus> {
    client: BootloaderClient<P>,
    page_retries: u32,
}

impl<P: CanBus> Flasher<P> {
    /// Create a flasher; the page retry budget comes from the client config.
    pub fn new(client: BootloaderClient<P>) -> Self {
        let page_retries = client.config().page_retries;
        Self {
            client,
            page_retries,
        }
    }

    /// Set how many times a page is attempted before giving up.
    ///
    /// Zero is treated as a single attempt.
    #[must_use]
    pub fn with_page_retries(mut self, page_retries: u32) -> Self {
        self.page_retries = page_retries;
        self
    }

    /// Get a reference to the client.
    pub fn client(&self) -> &BootloaderClient<P> {
        &self.client
    }

    /// Get a mutable reference to the client.
    pub fn client_mut(&mut self) -> &mut BootloaderClient<P> {
        &mut self.client
    }

    /// Consume the flasher and return the client.
    pub fn into_client(self) -> BootloaderClient<P> {
        self.client
    }

    /// Pad `data` to the configured page size and flash it.
    pub fn flash_bytes<F>(&mut self, board: u8, data: &[u8], progress: F) -> Result<FlashReport>
    where
        F: FnMut(usize, usize),
    {
        let image = FirmwareImage::new(data, self.client.config().page_size)?;
        self.flash(board, &image, progress)
    }

    /// Flash `image` to `board`.
    ///
    /// `progress` is called with `(pages_committed, page_count)` after every
    /// page the device accepts. Each call is independent; nothing carries
    /// over between flashes.
    ///
    /// # Errors
    ///
    /// * [`Error::ConnectionFailed`] if the handshake gets no answer. No page
    ///   traffic is sent in that case.
    /// * [`Error::PageWriteFailed`] if a page exhausts its attempts. Later
    ///   pages are not attempted.
    /// * [`Error::VerificationFailed`] if the device refuses the image CRC.
    /// * Transport errors propagate immediately.
    #[allow(clippy::cast_possible_truncation)]
    pub fn flash<F>(&mut self, board: u8, image: &FirmwareImage, mut progress: F) -> Result<FlashReport>
    where
        F: FnMut(usize, usize),
    {
        let config = self.client.config();
        config.validate()?;
        if image.page_size() != config.page_size {
            return Err(Error::Config(format!(
                "image paginated with {} byte pages, bus expects {}",
                image.page_size(),
                config.page_size
            )));
        }
        let engine = CrcEngine::new(config.crc);

        let page_count = image.page_count();
        info!(
            "Flashing {} bytes ({page_count} pages) to board {board}",
            image.len()
        );

        if !self.client.connect(board)? {
            return Err(Error::ConnectionFailed { board });
        }

        let mut image_crc = engine.accumulator();
        let mut retries_used = 0;

        for index in 0..page_count {
            // Safe cast: page count is bounded by FirmwareImage
            let page = index as u16;
            let words: Vec<[u8; 4]> = image.page_words(index).collect();

            let page_crc = engine.checksum_words(words.iter().copied());
            for word in &words {
                image_crc.update(*word);
            }

            retries_used += self.write_page(board, page, &words, page_crc)?;
            progress(index + 1, page_count);
        }

        self.verify(board, page_count as u16, &image_crc)?;

        info!("Flashing board {board} complete!");
        Ok(FlashReport {
            page_count,
            image_crc: image_crc.value(),
            page_retries_used: retries_used,
        })
    }

    /// Write one page with the full-page retry policy.
    ///
    /// Returns how many extra attempts were needed.
    fn write_page(&mut self, board: u8, page: u16, words: &[[u8; 4]], page_crc: u32) -> Result<u32> {
        let max_attempts = self.page_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.try_write_page(board, page, words, page_crc) {
                Ok(()) => {
                    debug!("Page {page} committed (attempt {attempt}/{max_attempts})");
                    return Ok(attempt - 1);
                },
                Err(e @ (Error::NoReply { .. } | Error::DeviceRejected { .. })) => {
                    if attempt < max_attempts {
                        warn!("Page {page} failed (attempt {attempt}/{max_attempts}): {e}");
                        warn!("Retrying page {page} from the first word...");
                    }
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }

        warn!("Giving up on page {page} after {max_attempts} attempts");
        Err(Error::PageWriteFailed {
            page,
            source: Box::new(last_error.unwrap_or(Error::NoReply {
                board,
                command: Command::WritePage,
            })),
        })
    }

    /// Single attempt at one page: fill the buffer, then commit.
    #[allow(clippy::cast_possible_truncation)]
    fn try_write_page(&mut self, board: u8, page: u16, words: &[[u8; 4]], page_crc: u32) -> Result<()> {
        for (offset, word) in words.iter().enumerate() {
            // Safe cast: words per page is validated against the param1 range
            self.client
                .command(board, Command::WriteBuffer, offset as u16, *word)?;
        }
        self.client
            .command(board, Command::WritePage, page, page_crc.to_be_bytes())?;
        Ok(())
    }

    /// Submit the whole-image CRC.
    fn verify(&mut self, board: u8, page_count: u16, image_crc: &CrcAccumulator<'_>) -> Result<()> {
        info!("Verifying image CRC 0x{:08X}", image_crc.value());
        match self
            .client
            .command(board, Command::WriteCrc, page_count, image_crc.digest())
        {
            Ok(_) => Ok(()),
            Err(e @ (Error::NoReply { .. } | Error::DeviceRejected { .. })) => {
                Err(Error::VerificationFailed {
                    source: Box::new(e),
                })
            },
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            port::sim::{ERR_INVALID_PAGE_NUM, Fault, SimBus, SimDevice},
            protocol::CommandFrame,
            target::ProtocolConfig,
        },
        std::time::Duration,
    };

    fn fast_config() -> ProtocolConfig {
        ProtocolConfig::default()
            .with_command_timing(Duration::from_millis(2), 3)
            .with_connect_timing(Duration::from_millis(2), 3)
    }

    fn flasher(bus: SimBus, config: ProtocolConfig) -> Flasher<SimBus> {
        let _ = env_logger::builder().is_test(true).try_init();
        Flasher::new(BootloaderClient::new(bus, config))
    }

    /// Deterministic 2048-byte image.
    fn sample_image() -> Vec<u8> {
        (0..2048u32).map(|i| (i % 251) as u8).collect()
    }

    fn bus(flasher: &Flasher<SimBus>) -> &SimBus {
        flasher.client().port()
    }

    #[test]
    fn test_flash_two_pages() {
        let config = fast_config();
        let mut flasher = flasher(SimBus::single(&config, 3), config);
        let mut calls = Vec::new();

        let report = flasher
            .flash_bytes(3, &sample_image(), |done, total| calls.push((done, total)))
            .unwrap();

        assert_eq!(report.page_count, 2);
        assert_eq!(report.image_crc, 0xDDE0_5EB1);
        assert_eq!(report.page_retries_used, 0);
        assert_eq!(calls, vec![(1, 2), (2, 2)]);

        let bus = bus(&flasher);
        assert_eq!(bus.count(Command::WriteBuffer), 512);
        assert_eq!(bus.count(Command::WritePage), 2);
        let crc = bus.sent_with(Command::WriteCrc);
        assert_eq!(crc.len(), 1);
        assert_eq!(crc[0].param1, 2);
        assert_eq!(crc[0].param2_value(), 0xDDE0_5EB1);
        assert_eq!(bus.devices[0].verified_pages, Some(2));
    }

    #[test]
    fn test_flash_wire_order() {
        let config = fast_config();
        let mut flasher = flasher(SimBus::single(&config, 3), config);
        flasher.flash_bytes(3, &sample_image(), |_, _| {}).unwrap();

        let sent = &bus(&flasher).sent;
        assert_eq!(sent[0].command, Command::Ping);
        // Page 0: 256 buffered words at offsets 0..256, then commit
        for (i, frame) in sent[1..257].iter().enumerate() {
            assert_eq!(frame.command, Command::WriteBuffer);
            assert_eq!(usize::from(frame.param1), i);
        }
        assert_eq!(sent[257].command, Command::WritePage);
        assert_eq!(sent[257].param1, 0);
        assert_eq!(sent[257].param2_value(), 0x9616_BB1D);
        assert_eq!(sent[514].command, Command::WritePage);
        assert_eq!(sent[514].param1, 1);
        assert_eq!(sent[514].param2_value(), 0xCDAB_842F);
        assert_eq!(sent[515].command, Command::WriteCrc);
        assert_eq!(sent.len(), 516);

        // The wire carries the image bytes in their file order
        let first = sent[1].build();
        assert_eq!(&first[4..], &sample_image()[..4]);
    }

    #[test]
    fn test_flash_stores_image_on_device() {
        let config = fast_config();
        let mut flasher = flasher(SimBus::single(&config, 3), config);
        let data = sample_image();
        flasher.flash_bytes(3, &data, |_, _| {}).unwrap();

        let stored = bus(&flasher).devices[0].flash[0].clone().unwrap();
        let expected = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(stored[0], expected);
    }

    #[test]
    fn test_image_crc_matches_page_streams() {
        let config = fast_config();
        let mut flasher = flasher(SimBus::single(&config, 3), config);
        let image = FirmwareImage::new(vec![0x5A; 2500], 1024).unwrap();
        let report = flasher.flash(3, &image, |_, _| {}).unwrap();

        let engine = CrcEngine::default();
        let all_words = (0..image.page_count()).flat_map(|p| image.page_words(p));
        assert_eq!(report.image_crc, engine.checksum_words(all_words));
        assert_eq!(report.page_count, 3);
    }

    #[test]
    fn test_rejected_word_fails_page_without_touching_next() {
        let config = fast_config();
        let device = SimDevice::new(3, config.words_per_page()).with_fault(|cmd: &CommandFrame| {
            if cmd.command == Command::WriteBuffer && cmd.param1 == 2 {
                Fault::Reject(ERR_INVALID_PAGE_NUM)
            } else {
                Fault::None
            }
        });
        let mut flasher = flasher(SimBus::new(&config, vec![device]), config).with_page_retries(3);
        let mut progress_calls = 0;

        let err = flasher
            .flash_bytes(3, &sample_image(), |_, _| progress_calls += 1)
            .unwrap_err();

        match err {
            Error::PageWriteFailed { page, source } => {
                assert_eq!(page, 0);
                assert!(matches!(
                    *source,
                    Error::DeviceRejected {
                        command: Command::WriteBuffer,
                        code: 1,
                        ..
                    }
                ));
            },
            other => panic!("unexpected error: {other:?}"),
        }

        let bus = bus(&flasher);
        // Three full-page attempts, each stopping at the third word
        assert_eq!(bus.count(Command::WriteBuffer), 3 * 3);
        assert_eq!(bus.count(Command::WritePage), 0);
        assert_eq!(bus.count(Command::WriteCrc), 0);
        assert_eq!(progress_calls, 0);
    }

    #[test]
    fn test_page_retry_restarts_from_first_word() {
        let config = fast_config();
        let mut rejected = false;
        let device = SimDevice::new(3, config.words_per_page()).with_fault(move |cmd| {
            if !rejected && cmd.command == Command::WriteBuffer && cmd.param1 == 100 {
                rejected = true;
                Fault::Reject(5)
            } else {
                Fault::None
            }
        });
        let mut flasher = flasher(SimBus::new(&config, vec![device]), config);

        let report = flasher.flash_bytes(3, &sample_image(), |_, _| {}).unwrap();
        assert_eq!(report.page_retries_used, 1);

        let bus = bus(&flasher);
        assert_eq!(bus.count(Command::WriteBuffer), 101 + 512);
        let restarts = bus
            .sent
            .windows(2)
            .filter(|w| w[0].param1 == 100 && w[1].param1 == 0 && w[1].command == Command::WriteBuffer)
            .count();
        assert_eq!(restarts, 1);
    }

    #[test]
    fn test_zero_page_retries_means_one_attempt() {
        let config = fast_config();
        let device = SimDevice::new(3, config.words_per_page()).with_fault(|cmd| {
            if cmd.command == Command::WritePage { Fault::Reject(2) } else { Fault::None }
        });
        let mut flasher = flasher(SimBus::new(&config, vec![device]), config).with_page_retries(0);

        assert!(matches!(
            flasher.flash_bytes(3, &[1, 2, 3, 4], |_, _| {}),
            Err(Error::PageWriteFailed { page: 0, .. })
        ));
        assert_eq!(bus(&flasher).count(Command::WritePage), 1);
    }

    #[test]
    fn test_silent_device_fails_connection() {
        let config = fast_config();
        let mut flasher = flasher(SimBus::silent(&config), config);

        assert!(matches!(
            flasher.flash_bytes(3, &sample_image(), |_, _| {}),
            Err(Error::ConnectionFailed { board: 3 })
        ));
        let bus = bus(&flasher);
        assert_eq!(bus.count(Command::Ping), 3);
        assert_eq!(bus.count(Command::WriteBuffer), 0);
        assert_eq!(bus.count(Command::WritePage), 0);
    }

    #[test]
    fn test_device_without_ping_reply_fails_connection() {
        let config = fast_config();
        let device = SimDevice::new(3, config.words_per_page()).with_fault(|cmd| {
            if cmd.command == Command::Ping { Fault::Drop } else { Fault::None }
        });
        let mut flasher = flasher(SimBus::new(&config, vec![device]), config);
        assert!(matches!(
            flasher.flash_bytes(3, &sample_image(), |_, _| {}),
            Err(Error::ConnectionFailed { .. })
        ));
        assert_eq!(bus(&flasher).count(Command::WriteBuffer), 0);
    }

    #[test]
    fn test_rejected_image_crc_fails_verification() {
        let config = fast_config();
        let device = SimDevice::new(3, config.words_per_page()).with_fault(|cmd| {
            if cmd.command == Command::WriteCrc { Fault::Reject(2) } else { Fault::None }
        });
        let mut flasher = flasher(SimBus::new(&config, vec![device]), config);

        let err = flasher
            .flash_bytes(3, &sample_image(), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { .. }));
        assert_eq!(bus(&flasher).count(Command::WriteCrc), 1);
    }

    #[test]
    fn test_lost_image_crc_reply_fails_verification() {
        let config = fast_config();
        let device = SimDevice::new(3, config.words_per_page()).with_fault(|cmd| {
            if cmd.command == Command::WriteCrc { Fault::Drop } else { Fault::None }
        });
        let mut flasher = flasher(SimBus::new(&config, vec![device]), config);

        let err = flasher
            .flash_bytes(3, &sample_image(), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { .. }));
        assert_eq!(bus(&flasher).count(Command::WriteCrc), 3);
    }

    #[test]
    fn test_flash_tolerates_bus_noise() {
        let config = fast_config();
        let mut sim = SimBus::single(&config, 3);
        sim.noise = true;
        let mut flasher = flasher(sim, config);
        let report = flasher.flash_bytes(3, &sample_image(), |_, _| {}).unwrap();
        assert_eq!(report.page_count, 2);
        assert_eq!(bus(&flasher).count(Command::WritePage), 2);
    }

    #[test]
    fn test_transport_error_is_not_page_retried() {
        let config = fast_config();
        let mut sim = SimBus::single(&config, 3);
        sim.fail_send = true;
        let mut flasher = flasher(sim, config);
        assert!(matches!(
            flasher.flash_bytes(3, &sample_image(), |_, _| {}),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn test_flash_is_repeatable() {
        let config = fast_config();
        let mut flasher = flasher(SimBus::single(&config, 3), config);
        let first = flasher.flash_bytes(3, &sample_image(), |_, _| {}).unwrap();
        let second = flasher.flash_bytes(3, &sample_image(), |_, _| {}).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_page_size_mismatch() {
        let config = fast_config();
        let mut flasher = flasher(SimBus::single(&config, 3), config);
        let image = FirmwareImage::new(vec![0; 64], 32).unwrap();
        assert!(matches!(flasher.flash(3, &image, |_, _| {}), Err(Error::Config(_))));
        assert!(bus(&flasher).sent.is_empty());
    }

    #[test]
    fn test_empty_image_rejected_before_traffic() {
        let config = fast_config();
        let mut flasher = flasher(SimBus::single(&config, 3), config);
        assert!(matches!(flasher.flash_bytes(3, &[], |_, _| {}), Err(Error::EmptyImage)));
        assert!(bus(&flasher).sent.is_empty());
    }
}
