//! Loader session - owns the secure channel and issues bootloader commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::channel::SecureChannel;
use crate::error::LoaderError;
use crate::events::{FrameDirection, LoaderEvent, LoaderObserver, TracingObserver};
use crate::image::ImageProvider;
use crate::protocol::constants::{DEFAULT_CLA, DEFAULT_MAX_FRAME};
use crate::protocol::{AppRecord, Command, CreateApp, parse_inventory};
use crate::transport::{ApduTransport, TransportError};

/// Bytes of each frame copied into `Frame` events.
const FRAME_PREVIEW: usize = 32;

/// Configuration for a loader session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Class byte of every command.
    pub cla: u8,
    /// Wrap commands in the secure channel.
    pub secure: bool,
    /// AES-128 key as 32 hex characters. Required when `secure` is set.
    pub key: Option<String>,
    /// Address segments relative to the lowest region start.
    pub relative: bool,
    /// Maximum APDU payload used when sizing chunks.
    pub max_frame: usize,
    /// USB read/write timeout in milliseconds.
    pub timeout_ms: u64,
    /// Target id checked before loading, if set.
    pub target_id: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cla: DEFAULT_CLA,
            secure: false,
            key: None,
            relative: true,
            max_frame: DEFAULT_MAX_FRAME,
            timeout_ms: 10_000,
            target_id: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build the session's secure channel.
    pub fn channel(&self) -> Result<SecureChannel, LoaderError> {
        match (self.secure, self.key.as_deref()) {
            (false, _) => Ok(SecureChannel::disabled()),
            (true, Some(key)) => Ok(SecureChannel::from_hex_key(key)?),
            (true, None) => Err(LoaderError::Config(
                "secure channel enabled but no key given".into(),
            )),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One loader session.
///
/// Every operation takes `&mut self`: the secure channel's IV advances with
/// each command, so commands must be issued one at a time and in order.
/// Without a transport the session runs dry: frames are traced and every
/// response is empty.
pub struct LoaderSession<O: LoaderObserver = TracingObserver> {
    pub(crate) cla: u8,
    pub(crate) relative: bool,
    pub(crate) max_frame: usize,
    pub(crate) channel: SecureChannel,
    transport: Option<Box<dyn ApduTransport>>,
    pub(crate) observer: Arc<O>,
}

impl LoaderSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(
        config: &SessionConfig,
        transport: Option<Box<dyn ApduTransport>>,
    ) -> Result<Self, LoaderError> {
        Self::with_observer(config, transport, Arc::new(TracingObserver))
    }
}

impl<O: LoaderObserver> LoaderSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(
        config: &SessionConfig,
        transport: Option<Box<dyn ApduTransport>>,
        observer: Arc<O>,
    ) -> Result<Self, LoaderError> {
        Ok(Self {
            cla: config.cla,
            relative: config.relative,
            max_frame: config.max_frame,
            channel: config.channel()?,
            transport,
            observer,
        })
    }

    /// Replace the secure channel, e.g. with one resuming a known IV.
    pub fn with_channel(mut self, channel: SecureChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn channel(&self) -> &SecureChannel {
        &self.channel
    }

    pub fn is_dry_run(&self) -> bool {
        self.transport.is_none()
    }

    pub(crate) fn emit(&self, event: LoaderEvent) {
        self.observer.on_event(&event);
    }

    /// Frame, send and return the raw (still encrypted) response.
    fn send(&mut self, command: &Command) -> Result<Vec<u8>, LoaderError> {
        let apdu = command.to_apdu(self.cla, &mut self.channel)?;

        let Some(transport) = &self.transport else {
            self.emit(LoaderEvent::DryRun {
                command: command.name(),
                frame: apdu.to_string(),
            });
            return Ok(Vec::new());
        };
        if !transport.is_connected() {
            return Err(TransportError::Disconnected.into());
        }

        self.observer.on_event(&LoaderEvent::Frame {
            direction: FrameDirection::Tx,
            command: command.name(),
            length: apdu.data().len(),
            data: Some(apdu.data().iter().take(FRAME_PREVIEW).copied().collect()),
        });
        let response = transport.exchange(&apdu)?;
        if !response.is_empty() {
            self.observer.on_event(&LoaderEvent::Frame {
                direction: FrameDirection::Rx,
                command: command.name(),
                length: response.len(),
                data: Some(response.iter().take(FRAME_PREVIEW).copied().collect()),
            });
        }
        Ok(response)
    }

    pub fn select_segment(&mut self, address: u32) -> Result<(), LoaderError> {
        self.send(&Command::SelectSegment { address })?;
        Ok(())
    }

    pub fn load_segment_chunk(&mut self, offset: u16, chunk: &[u8]) -> Result<(), LoaderError> {
        self.send(&Command::LoadSegmentChunk {
            offset,
            chunk: chunk.to_vec(),
        })?;
        Ok(())
    }

    pub fn flush_segment(&mut self) -> Result<(), LoaderError> {
        self.send(&Command::FlushSegment)?;
        Ok(())
    }

    pub fn crc_segment(&mut self, offset: u16, length: u32, crc: u16) -> Result<(), LoaderError> {
        self.send(&Command::CrcSegment {
            offset,
            length,
            crc,
        })?;
        Ok(())
    }

    /// Check the device's target id. Sent in clear, outside the secure channel.
    #[instrument(skip(self), fields(target_id = %format!("0x{:08X}", target_id)))]
    pub fn validate_target_id(&mut self, target_id: u32) -> Result<(), LoaderError> {
        self.send(&Command::ValidateTargetId { target_id })?;
        Ok(())
    }

    /// Jump to `address` (Thumb bit forced on).
    #[instrument(skip(self, signature), fields(address = %format!("0x{:08X}", address)))]
    pub fn boot(&mut self, address: u32, signature: Option<&[u8]>) -> Result<(), LoaderError> {
        self.send(&Command::Boot {
            address,
            signature: signature.map(<[u8]>::to_vec),
        })?;
        info!("Boot command sent");
        Ok(())
    }

    /// Boot an image loaded by this session, translating `boot_address` with
    /// the same origin the load used.
    pub fn run<I: ImageProvider + ?Sized>(
        &mut self,
        image: &I,
        boot_address: u32,
        signature: Option<&[u8]>,
    ) -> Result<(), LoaderError> {
        let origin = self.origin(image);
        let address = boot_address
            .checked_sub(origin)
            .ok_or(LoaderError::BelowOrigin {
                start: boot_address,
                origin,
            })?;
        self.boot(address, signature)
    }

    #[instrument(skip(self, app), fields(name = %String::from_utf8_lossy(&app.name)))]
    pub fn create_app(&mut self, app: CreateApp) -> Result<(), LoaderError> {
        self.send(&Command::CreateApp(app))?;
        Ok(())
    }

    #[instrument(skip(self, name), fields(name = %String::from_utf8_lossy(name)))]
    pub fn delete_app(&mut self, name: &[u8]) -> Result<(), LoaderError> {
        self.send(&Command::DeleteApp {
            name: name.to_vec(),
        })?;
        Ok(())
    }

    /// Fetch one page of the installed application list.
    pub fn list_apps(&mut self, restart: bool) -> Result<Vec<AppRecord>, LoaderError> {
        let response = self.send(&Command::ListApps { restart })?;
        let plaintext = self.channel.decrypt(&response)?;
        let records = parse_inventory(&plaintext)?;
        debug!(restart, count = records.len(), "Inventory page decoded");
        Ok(records)
    }

    /// Page through the whole application list.
    pub fn list_all_apps(&mut self) -> Result<Vec<AppRecord>, LoaderError> {
        let mut apps = self.list_apps(true)?;
        if apps.is_empty() {
            return Ok(apps);
        }
        loop {
            let page = self.list_apps(false)?;
            if page.is_empty() {
                break;
            }
            apps.extend(page);
        }
        info!(count = apps.len(), "Listed installed applications");
        Ok(apps)
    }

    pub fn setup_custom_ca(&mut self, name: &[u8], public_key: &[u8]) -> Result<(), LoaderError> {
        self.send(&Command::SetupCustomCa {
            name: name.to_vec(),
            public_key: public_key.to_vec(),
        })?;
        Ok(())
    }

    pub fn reset_custom_ca(&mut self) -> Result<(), LoaderError> {
        self.send(&Command::ResetCustomCa)?;
        Ok(())
    }

    /// Address subtracted from region starts: the lowest start in relative
    /// mode, zero otherwise.
    pub(crate) fn origin<I: ImageProvider + ?Sized>(&self, image: &I) -> u32 {
        if self.relative {
            image.min_address()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BLOCK_SIZE;
    use crate::events::RecordingObserver;
    use crate::image::SegmentedImage;
    use crate::protocol::constants::*;
    use crate::transport::MockTransport;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f";

    fn session_with(config: &SessionConfig) -> (LoaderSession, MockTransport) {
        let mock = MockTransport::new();
        let session = LoaderSession::new(config, Some(Box::new(mock.clone()))).unwrap();
        (session, mock)
    }

    fn inventory_entry(name: &[u8], flags: u32, fill: u8) -> Vec<u8> {
        let mut buf = vec![(1 + name.len() + 4 + APP_HASH_SIZE) as u8, name.len() as u8];
        buf.extend_from_slice(name);
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&[fill; APP_HASH_SIZE]);
        buf
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.cla, 0xF0);
        assert_eq!(config.max_frame, 0xF0);
        assert!(config.relative);
        assert!(!config.channel().unwrap().is_enabled());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = SessionConfig {
            secure: true,
            key: Some(TEST_KEY.into()),
            target_id: Some(0x3110_0004),
            ..Default::default()
        };
        let path = std::env::temp_dir().join(format!("hexload-{}.toml", std::process::id()));
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);

        let partial: SessionConfig = toml::from_str("secure = false\nmax_frame = 64\n").unwrap();
        assert_eq!(partial.max_frame, 64);
        assert_eq!(partial.cla, DEFAULT_CLA);
    }

    #[test]
    fn test_secure_without_key() {
        let config = SessionConfig {
            secure: true,
            ..Default::default()
        };
        assert!(matches!(
            LoaderSession::new(&config, None),
            Err(LoaderError::Config(_))
        ));
    }

    #[test]
    fn test_validate_target_id_in_clear() {
        let config = SessionConfig {
            secure: true,
            key: Some(TEST_KEY.into()),
            ..Default::default()
        };
        let (mut session, mock) = session_with(&config);
        session.validate_target_id(0x3110_0004).unwrap();

        let sent = mock.sent();
        assert_eq!(
            sent[0].to_bytes(),
            vec![0xF0, 0x04, 0x00, 0x00, 0x04, 0x31, 0x10, 0x00, 0x04]
        );
        assert_eq!(session.channel().iv(), &[0u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_encrypted_list_apps() {
        let config = SessionConfig {
            secure: true,
            key: Some(TEST_KEY.into()),
            ..Default::default()
        };
        let (mut session, mock) = session_with(&config);
        mock.queue_response(
            &hex::decode(concat!(
                "b8fd772339dbd1acd8d33bb353785634",
                "505ef714b1d2bea15803adcc407f449e",
                "28d7bc70e6878726f65036bb2166e175"
            ))
            .unwrap(),
        );

        let apps = session.list_apps(true).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name_lossy(), "Bitcoin");
        assert_eq!(apps[0].flags, 0x0840);
        assert_eq!(apps[0].hash, [0x5A; APP_HASH_SIZE]);

        // The next command chains on the response ciphertext.
        session.list_apps(false).unwrap();
        let sent = mock.sent();
        assert_eq!(
            sent[0].data(),
            &hex::decode("5c5f43579897784cd2e43950e974556d").unwrap()[..]
        );
        assert_eq!(
            sent[1].data(),
            &hex::decode("5c11ed6e608e7eed226e616d38be905f").unwrap()[..]
        );
    }

    #[test]
    fn test_list_all_apps_pages() {
        let (mut session, mock) = session_with(&SessionConfig::default());
        let mut page = inventory_entry(b"Bitcoin", 0x40, 0x01);
        page.extend(inventory_entry(b"Ethereum", 0x40, 0x02));
        mock.queue_response(&page);
        mock.queue_response(&inventory_entry(b"Vault", 0x00, 0x03));

        let apps = session.list_all_apps().unwrap();
        let names: Vec<String> = apps.iter().map(AppRecord::name_lossy).collect();
        assert_eq!(names, ["Bitcoin", "Ethereum", "Vault"]);

        let opcodes: Vec<u8> = mock.sent().iter().map(|a| a.data()[0]).collect();
        assert_eq!(opcodes, [OP_LIST_APP, OP_LIST_APP_CONTINUE, OP_LIST_APP_CONTINUE]);
    }

    #[test]
    fn test_malformed_inventory() {
        let (mut session, mock) = session_with(&SessionConfig::default());
        mock.queue_response(&[0x2C, 0x07, b'B']);
        assert!(matches!(
            session.list_apps(true),
            Err(LoaderError::Inventory(_))
        ));
    }

    #[test]
    fn test_status_word_propagates() {
        let (mut session, mock) = session_with(&SessionConfig::default());
        mock.queue_status(0x6985);
        assert!(matches!(
            session.delete_app(b"app"),
            Err(LoaderError::Transport(TransportError::Status { sw: 0x6985 }))
        ));
    }

    #[test]
    fn test_disconnected_device_fails_fast() {
        let (mut session, mock) = session_with(&SessionConfig::default());
        mock.disconnect();
        assert!(matches!(
            session.flush_segment(),
            Err(LoaderError::Transport(TransportError::Disconnected))
        ));
        assert!(mock.sent().is_empty());

        mock.reconnect();
        session.flush_segment().unwrap();
        assert_eq!(mock.sent().len(), 1);
    }

    #[test]
    fn test_run_boots_relative_to_origin() {
        let (mut session, mock) = session_with(&SessionConfig::default());
        let mut image = SegmentedImage::new();
        image.push(0xC0D0_0000, vec![0; 16]).unwrap();

        session.run(&image, 0xC0D0_0100, Some(&[0xAA])).unwrap();
        assert_eq!(
            mock.sent()[0].data(),
            &[OP_BOOT, 0x00, 0x00, 0x01, 0x01, 0x01, 0xAA]
        );

        let absolute = SessionConfig {
            relative: false,
            ..Default::default()
        };
        let (mut session, mock) = session_with(&absolute);
        session.run(&image, 0xC0D0_0100, None).unwrap();
        assert_eq!(mock.sent()[0].data(), &[OP_BOOT, 0xC0, 0xD0, 0x01, 0x01]);
    }

    #[test]
    fn test_app_management_frames() {
        let (mut session, mock) = session_with(&SessionConfig::default());
        session
            .create_app(CreateApp {
                length: 0x100,
                flags: 0x40,
                name: b"app".to_vec(),
                ..Default::default()
            })
            .unwrap();
        session.setup_custom_ca(b"ca", &[0x04; 65]).unwrap();
        session.reset_custom_ca().unwrap();

        let opcodes: Vec<u8> = mock.sent().iter().map(|a| a.data()[0]).collect();
        assert_eq!(opcodes, [OP_CREATE_APP, OP_SETUP_CUSTOM_CA, OP_RESET_CUSTOM_CA]);
        assert!(mock.sent().iter().all(|a| a.cla == DEFAULT_CLA && a.ins == 0x00));
    }

    #[test]
    fn test_dry_run_traces_frames() {
        let observer = Arc::new(RecordingObserver::new());
        let mut session =
            LoaderSession::with_observer(&SessionConfig::default(), None, observer.clone())
                .unwrap();
        assert!(session.is_dry_run());

        session.flush_segment().unwrap();
        assert!(session.list_all_apps().unwrap().is_empty());

        let events = observer.events();
        assert_eq!(
            events[0],
            LoaderEvent::DryRun {
                command: "flushSegment",
                frame: "f00000000107".into(),
            }
        );
        assert_eq!(events.len(), 2);
    }
}
