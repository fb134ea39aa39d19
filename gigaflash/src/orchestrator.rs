//! End-to-end flashing sequence for both cores.
//!
//! ```text
//! LocatePort
//!   -> TriggerBootloader(primary)   -> Upload(primary)   -> AwaitBoot(primary)
//!   -> TriggerBootloader(secondary) -> PatchSecondary    -> Upload(secondary)
//!   -> AwaitBoot(secondary)
//!   -> Validate -> Done
//! ```
//!
//! Bootloader mode only accepts one core's region per trigger cycle, so the
//! primary core is written and booted before the secondary core's trigger.
//! The run aborts on the first failing step; the board is left in whatever
//! state the last write produced. A validation failure does not abort: the
//! board already runs the new image, so it is reported in [`RunReport`]
//! instead.

use crate::bus::{DeviceBus, PollPolicy, wait_for_board};
use crate::device::{BoardIdentity, BoardPort, require_board};
use crate::error::{Error, Result};
use crate::image::{self, FirmwareImage, PatchOutcome};
use crate::protocol::dfu::enter_bootloader;
use crate::protocol::probe::{self, Verdict};
use crate::serial_number::SerialNumber;
use crate::target::{Core, DeviceTarget};
use crate::tool::FlashTool;
use log::{debug, info, warn};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// A phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Remove any stale staging file and find the board among the host's
    /// serial ports.
    LocatePort,
    /// Send the bootloader touch and wait for the board to leave
    /// application mode.
    TriggerBootloader(Core),
    /// Write a core's image.
    Upload(Core),
    /// Wait for the board to boot the new image.
    AwaitBoot(Core),
    /// Read a core's current image.
    ReadBack(Core),
    /// Write the serial number into the secondary image.
    PatchSecondary,
    /// Run the validation handshake.
    Validate,
    /// Run finished.
    Done,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocatePort => write!(f, "locate port"),
            Self::TriggerBootloader(core) => write!(f, "enter bootloader for {core} core"),
            Self::Upload(core) => write!(f, "upload {core} image"),
            Self::AwaitBoot(core) => write!(f, "await {core} boot"),
            Self::ReadBack(core) => write!(f, "read back {core} image"),
            Self::PatchSecondary => write!(f, "patch secondary image"),
            Self::Validate => write!(f, "validate"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Polling and settle parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// How long to wait for the board to leave application mode.
    pub bootloader_timeout: Duration,
    /// How long to wait for the board to come back after a write.
    pub boot_timeout: Duration,
    /// Pause after leaving application mode before the flash tool runs.
    /// The DFU interface enumerates well after the serial port is gone.
    pub settle: Duration,
    /// Pause after the board is enumerated again before validation, while
    /// the secondary core finishes booting.
    pub boot_settle: Duration,
    /// First polling interval.
    pub poll_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            bootloader_timeout: Duration::from_millis(5000),
            boot_timeout: Duration::from_millis(10_000),
            settle: Duration::from_millis(2000),
            boot_settle: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl Timing {
    fn departure_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.bootloader_timeout)
    }

    fn boot_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.boot_timeout)
    }
}

/// Images and serial number for one run, checked before any hardware
/// interaction.
#[derive(Debug, Clone)]
pub struct FlashPlan {
    target: Option<DeviceTarget>,
    primary: FirmwareImage,
    secondary: FirmwareImage,
    serial: Option<SerialNumber>,
}

impl FlashPlan {
    /// Load both images for `target` from `dir`.
    ///
    /// Fails if either file is unreadable or, when `serial` is given, if
    /// the secondary image cannot be patched.
    pub fn prepare(dir: &Path, target: DeviceTarget, serial: Option<SerialNumber>) -> Result<Self> {
        let (primary_path, secondary_path) = target.firmware_paths(dir);
        let primary = FirmwareImage::from_file(&primary_path)?;
        let secondary = FirmwareImage::from_file(&secondary_path)?;
        let mut plan = Self::from_images(primary, secondary, serial)?;
        plan.target = Some(target);
        Ok(plan)
    }

    /// Build a plan from images already in memory.
    pub fn from_images(
        primary: FirmwareImage,
        secondary: FirmwareImage,
        serial: Option<SerialNumber>,
    ) -> Result<Self> {
        if primary.is_empty() {
            return Err(Error::Config("primary image is empty".to_string()));
        }
        if secondary.is_empty() {
            return Err(Error::Config("secondary image is empty".to_string()));
        }
        if let Some(serial) = &serial {
            // Dry run: the real patch happens after the primary core is
            // flashed, and must not be able to fail there.
            image::patch(secondary.as_bytes(), serial.as_str())?;
        }
        Ok(Self {
            target: None,
            primary,
            secondary,
            serial,
        })
    }

    /// Primary-core image.
    pub fn primary(&self) -> &FirmwareImage {
        &self.primary
    }

    /// Secondary-core image as shipped, before patching.
    pub fn secondary(&self) -> &FirmwareImage {
        &self.secondary
    }

    /// Serial number to write, if any.
    pub fn serial(&self) -> Option<&SerialNumber> {
        self.serial.as_ref()
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunReport {
    /// Board as last seen after booting.
    pub board: BoardPort,
    /// Hardware variant flashed.
    pub target: Option<DeviceTarget>,
    /// Serial number written, if any.
    pub serial: Option<SerialNumber>,
    /// Serial field change, if a patch ran.
    pub patch: Option<PatchOutcome>,
    /// Validation result. An error here is a probe failure, not a flash
    /// failure.
    pub validation: Result<Verdict>,
    /// Steps completed, in order.
    pub steps: Vec<Step>,
}

impl RunReport {
    /// Whether validation passed.
    #[must_use]
    pub fn validated(&self) -> bool {
        matches!(&self.validation, Ok(verdict) if verdict.is_pass())
    }
}

/// Transient state of one run.
#[derive(Debug)]
struct FlashSession {
    board: Option<BoardPort>,
    target: Option<DeviceTarget>,
    serial: Option<SerialNumber>,
    step: Step,
    completed: Vec<Step>,
    last_error: Option<String>,
}

impl FlashSession {
    fn new(target: Option<DeviceTarget>, serial: Option<SerialNumber>) -> Self {
        Self {
            board: None,
            target,
            serial,
            step: Step::LocatePort,
            completed: Vec::new(),
            last_error: None,
        }
    }

    fn written(&self) -> Vec<Core> {
        self.completed
            .iter()
            .filter_map(|step| match step {
                Step::Upload(core) => Some(*core),
                _ => None,
            })
            .collect()
    }

    fn fail(&mut self, err: Error) -> Error {
        self.last_error = Some(err.to_string());
        let written = self.written();
        if !written.is_empty() {
            let cores: Vec<String> = written
                .iter()
                .map(ToString::to_string)
                .collect();
            warn!(
                "Run aborted after writing {}; re-run the full sequence to recover",
                cores.join(" and ")
            );
        }
        debug!(
            "Session on {:?} failed at '{}': {}",
            self.board.as_ref().map(|b| b.path.as_str()),
            self.step,
            self.last_error.as_deref().unwrap_or_default()
        );
        err.at(self.step)
    }

    fn into_report(
        self,
        board: BoardPort,
        patch: Option<PatchOutcome>,
        validation: Result<Verdict>,
    ) -> RunReport {
        RunReport {
            board,
            target: self.target,
            serial: self.serial,
            patch,
            validation,
            steps: self.completed,
        }
    }
}

/// Drives a run against one pinned board.
pub struct FlashOrchestrator<B: DeviceBus, T: FlashTool> {
    bus: B,
    tool: T,
    identity: BoardIdentity,
    timing: Timing,
}

impl<B: DeviceBus, T: FlashTool> FlashOrchestrator<B, T> {
    /// Create an orchestrator with default identity and timing.
    pub fn new(bus: B, tool: T) -> Self {
        Self {
            bus,
            tool,
            identity: BoardIdentity::default(),
            timing: Timing::default(),
        }
    }

    /// Set the board identity used to locate the board.
    #[must_use]
    pub fn with_identity(mut self, identity: BoardIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Set polling and settle parameters.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Flash both cores and validate.
    ///
    /// `pinned` selects the board; without it the first port matching the
    /// identity is used. `progress` is called as each step starts.
    pub fn run(
        &mut self,
        plan: &FlashPlan,
        pinned: Option<BoardPort>,
        progress: &mut dyn FnMut(Step),
    ) -> Result<RunReport> {
        let session = FlashSession::new(plan.target, plan.serial.clone());
        let result = self.flash_both(session, plan, pinned.as_ref(), progress);
        self.finish_staging();
        result
    }

    /// Rewrite the serial number of the image already on the board's
    /// secondary core, then validate.
    pub fn reserialize(
        &mut self,
        serial: &SerialNumber,
        pinned: Option<BoardPort>,
        progress: &mut dyn FnMut(Step),
    ) -> Result<RunReport> {
        let session = FlashSession::new(None, Some(serial.clone()));
        let result = self.rewrite_serial(session, serial, pinned.as_ref(), progress);
        self.finish_staging();
        result
    }

    fn finish_staging(&mut self) {
        if let Err(e) = self.tool.clear_staging() {
            warn!("Could not remove staging file: {e}");
        }
    }

    fn step<R>(
        &mut self,
        session: &mut FlashSession,
        step: Step,
        progress: &mut dyn FnMut(Step),
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        session.step = step;
        info!("Step: {step}");
        progress(step);
        match f(self) {
            Ok(value) => {
                session.completed.push(step);
                Ok(value)
            },
            Err(e) => Err(session.fail(e)),
        }
    }

    fn locate(&mut self, pinned: Option<&BoardPort>) -> Result<BoardPort> {
        self.tool.clear_staging()?;
        let ports = self.bus.list_ports()?;
        let board = require_board(&ports, &self.identity, pinned)?;
        info!(
            "Board on {}{}",
            board.path,
            board
                .usb_serial
                .as_deref()
                .map(|s| format!(" (USB serial {s})"))
                .unwrap_or_default()
        );
        Ok(board)
    }

    fn trigger(&mut self, board: &BoardPort) -> Result<()> {
        let policy = self.timing.departure_policy();
        let settle = self.timing.settle;
        enter_bootloader(&mut self.bus, board, &policy, settle)
    }

    fn await_boot(&mut self, board: &BoardPort) -> Result<BoardPort> {
        let policy = self.timing.boot_policy();
        let booted = wait_for_board(&mut self.bus, &self.identity, board, &policy)?;
        if booted.path != board.path {
            info!("Board re-enumerated as {}", booted.path);
        }
        Ok(booted)
    }

    /// Trigger, write and wait for one core. Returns the board as it
    /// re-enumerated.
    fn write_core(
        &mut self,
        session: &mut FlashSession,
        core: Core,
        board: &BoardPort,
        bytes: &[u8],
        progress: &mut dyn FnMut(Step),
    ) -> Result<BoardPort> {
        self.step(session, Step::Upload(core), progress, |this| {
            this.tool.write_image(core, bytes)
        })?;
        let board = self.step(session, Step::AwaitBoot(core), progress, |this| {
            this.await_boot(board)
        })?;
        session.board = Some(board.clone());
        Ok(board)
    }

    fn patch_secondary(image: &mut FirmwareImage, serial: &SerialNumber) -> Result<PatchOutcome> {
        let outcome = image.patch_serial(serial.as_str())?;
        let field = image.serial_field()?;
        if field.value != serial.as_str() {
            return Err(Error::FieldMismatch {
                offset: field.offset,
                value: field.value,
            });
        }
        if outcome.unchanged() {
            info!("Secondary image already carries {serial}");
        }
        Ok(outcome)
    }

    fn validate(&mut self, board: &BoardPort, serial: Option<&SerialNumber>) -> Result<Verdict> {
        let verdict = probe::validate(&mut self.bus, &board.path, serial.map(SerialNumber::as_str));
        match &verdict {
            Ok(v) if v.is_pass() => info!("Validation passed on {}", board.path),
            Ok(v) => warn!("Validation did not pass: {v:?}"),
            Err(e) => warn!("Validation could not complete: {e}"),
        }
        verdict
    }

    /// Validate and close the run. Validation never fails the run.
    fn finish(
        &mut self,
        mut session: FlashSession,
        board: BoardPort,
        patch: Option<PatchOutcome>,
        progress: &mut dyn FnMut(Step),
    ) -> RunReport {
        session.step = Step::Validate;
        progress(Step::Validate);
        if !self.timing.boot_settle.is_zero() {
            debug!("Waiting {:?} for the board to finish booting", self.timing.boot_settle);
            self.bus.sleep(self.timing.boot_settle);
        }
        let validation = self.validate(&board, session.serial.as_ref());
        session.completed.push(Step::Validate);

        progress(Step::Done);
        session.completed.push(Step::Done);
        session.into_report(board, patch, validation)
    }

    fn flash_both(
        &mut self,
        mut session: FlashSession,
        plan: &FlashPlan,
        pinned: Option<&BoardPort>,
        progress: &mut dyn FnMut(Step),
    ) -> Result<RunReport> {
        let board = self.step(&mut session, Step::LocatePort, progress, |this| this.locate(pinned))?;
        session.board = Some(board.clone());

        self.step(&mut session, Step::TriggerBootloader(Core::Primary), progress, |this| {
            this.trigger(&board)
        })?;
        let board = self.write_core(
            &mut session,
            Core::Primary,
            &board,
            plan.primary.as_bytes(),
            progress,
        )?;

        self.step(&mut session, Step::TriggerBootloader(Core::Secondary), progress, |this| {
            this.trigger(&board)
        })?;

        let mut secondary = plan.secondary.clone();
        let patch = match &plan.serial {
            Some(serial) => Some(self.step(&mut session, Step::PatchSecondary, progress, |_| {
                Self::patch_secondary(&mut secondary, serial)
            })?),
            None => {
                info!("No serial number given, uploading secondary image as shipped");
                None
            },
        };

        let board = self.write_core(
            &mut session,
            Core::Secondary,
            &board,
            secondary.as_bytes(),
            progress,
        )?;

        Ok(self.finish(session, board, patch, progress))
    }

    fn rewrite_serial(
        &mut self,
        mut session: FlashSession,
        serial: &SerialNumber,
        pinned: Option<&BoardPort>,
        progress: &mut dyn FnMut(Step),
    ) -> Result<RunReport> {
        let board = self.step(&mut session, Step::LocatePort, progress, |this| this.locate(pinned))?;
        session.board = Some(board.clone());

        self.step(&mut session, Step::TriggerBootloader(Core::Secondary), progress, |this| {
            this.trigger(&board)
        })?;
        let mut image = self.step(&mut session, Step::ReadBack(Core::Secondary), progress, |this| {
            this.tool
                .read_image(Core::Secondary)
                .map(FirmwareImage::from_bytes)
        })?;
        debug!("Read back {} bytes", image.len());

        let patch = self
            .step(&mut session, Step::PatchSecondary, progress, |_| {
                Self::patch_secondary(&mut image, serial)
            })
            .inspect_err(|_| {
                warn!("Nothing was written; the board stays in bootloader mode until reset");
            })?;

        let board = self.write_core(
            &mut session,
            Core::Secondary,
            &board,
            image.as_bytes(),
            progress,
        )?;

        Ok(self.finish(session, board, Some(patch), progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SERIAL_MARKER;
    use crate::port::mock::MockPort;
    use crate::port::{Port, PortInfo, SerialConfig};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        ClearStaging,
        Touch(String),
        Write(Core),
        Read(Core),
        Probe(String),
    }

    /// A board and host simulated together.
    struct Sim {
        events: Vec<Event>,
        path: String,
        usb_serial: String,
        enumerated: bool,
        in_bootloader: bool,
        booting: Option<u32>,
        flash: HashMap<Core, Vec<u8>>,
        refuse_touch: bool,
        fail_write: Option<Core>,
        boots: bool,
        boot_polls: u32,
        reenumerate_as: Option<String>,
        reported_serial: Option<String>,
        other_board_first: bool,
        slept: Duration,
        /// Each sleep, keyed by the number of events recorded before it.
        naps: Vec<(usize, Duration)>,
        staging_locked: bool,
    }

    impl Default for Sim {
        fn default() -> Self {
            Self {
                events: Vec::new(),
                path: "/dev/ttyACM0".to_string(),
                usb_serial: "2A0017".to_string(),
                enumerated: true,
                in_bootloader: false,
                booting: None,
                flash: HashMap::new(),
                refuse_touch: false,
                fail_write: None,
                boots: true,
                boot_polls: 2,
                reenumerate_as: None,
                reported_serial: None,
                other_board_first: false,
                slept: Duration::ZERO,
                naps: Vec::new(),
                staging_locked: false,
            }
        }
    }

    fn giga(name: &str, usb_serial: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: Some(0x2341),
            pid: Some(0x0266),
            manufacturer: Some("Arduino".to_string()),
            product: Some("Giga R1 WiFi".to_string()),
            serial_number: Some(usb_serial.to_string()),
        }
    }

    struct SimBus(Rc<RefCell<Sim>>);
    struct SimTool(Rc<RefCell<Sim>>);

    impl DeviceBus for SimBus {
        fn list_ports(&mut self) -> Result<Vec<PortInfo>> {
            let mut sim = self.0.borrow_mut();
            if let Some(remaining) = sim.booting {
                if remaining == 0 {
                    sim.booting = None;
                    sim.enumerated = true;
                } else {
                    sim.booting = Some(remaining - 1);
                }
            }

            let mut ports = Vec::new();
            if sim.other_board_first {
                ports.push(giga("/dev/ttyACM9", "OTHER"));
            }
            if sim.enumerated {
                ports.push(giga(&sim.path, &sim.usb_serial));
            }
            ports.push(PortInfo {
                name: "/dev/ttyUSB0".to_string(),
                manufacturer: Some("FTDI".to_string()),
                product: Some("FT232R".to_string()),
                ..PortInfo::default()
            });
            Ok(ports)
        }

        fn open(&mut self, config: &SerialConfig) -> Result<Box<dyn Port>> {
            let mut sim = self.0.borrow_mut();
            let name = config.port_name.clone();
            if name != sim.path || !sim.enumerated {
                return Err(Error::Io(io::Error::new(io::ErrorKind::NotFound, "no such port")));
            }
            if config.baud_rate == 1200 {
                if sim.refuse_touch {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "permission denied",
                    )));
                }
                sim.events.push(Event::Touch(name.clone()));
                sim.enumerated = false;
                sim.in_bootloader = true;
                return Ok(Box::new(MockPort::new()));
            }

            sim.events.push(Event::Probe(name.clone()));
            let serial = sim.reported_serial.clone().unwrap_or_else(|| {
                sim.flash
                    .get(&Core::Secondary)
                    .and_then(|image| image::locate(image).ok())
                    .map(|field| field.value)
                    .unwrap_or_default()
            });
            Ok(Box::new(
                MockPort::new()
                    .reply_line("NOP")
                    .reply_line("Arduino GIGA DAQ")
                    .reply_line(&serial),
            ))
        }

        fn sleep(&mut self, duration: Duration) {
            let mut sim = self.0.borrow_mut();
            sim.slept += duration;
            let at = sim.events.len();
            sim.naps.push((at, duration));
        }
    }

    impl FlashTool for SimTool {
        fn write_image(&mut self, core: Core, image: &[u8]) -> Result<()> {
            let mut sim = self.0.borrow_mut();
            if !sim.in_bootloader {
                return Err(Error::FlashWriteFailed {
                    core,
                    detail: "no DFU capable USB device available".to_string(),
                });
            }
            if sim.fail_write == Some(core) {
                return Err(Error::FlashWriteFailed {
                    core,
                    detail: "exited with exit status: 74".to_string(),
                });
            }
            sim.events.push(Event::Write(core));
            sim.flash.insert(core, image.to_vec());
            sim.in_bootloader = false;
            if let Some(path) = sim.reenumerate_as.take() {
                sim.path = path;
            }
            if sim.boots {
                sim.booting = Some(sim.boot_polls);
            }
            Ok(())
        }

        fn read_image(&mut self, core: Core) -> Result<Vec<u8>> {
            let mut sim = self.0.borrow_mut();
            if !sim.in_bootloader {
                return Err(Error::FlashReadFailed {
                    core,
                    detail: "no DFU capable USB device available".to_string(),
                });
            }
            sim.events.push(Event::Read(core));
            Ok(sim.flash.get(&core).cloned().unwrap_or_default())
        }

        fn clear_staging(&mut self) -> Result<()> {
            let mut sim = self.0.borrow_mut();
            if sim.staging_locked {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "staging file is read-only",
                )));
            }
            sim.events.push(Event::ClearStaging);
            Ok(())
        }
    }

    fn secondary_image(serial: &str) -> Vec<u8> {
        let mut bytes = vec![0xE5; 64];
        bytes.extend_from_slice(SERIAL_MARKER);
        bytes.extend_from_slice(serial.as_bytes());
        bytes.resize(64 + SERIAL_MARKER.len() + 12, 0);
        bytes.extend_from_slice(&[0x5A; 64]);
        bytes
    }

    fn plan(serial: Option<&str>) -> FlashPlan {
        FlashPlan::from_images(
            FirmwareImage::from_bytes(vec![0x7E; 128]),
            FirmwareImage::from_bytes(secondary_image("DA_2025_001")),
            serial.map(|s| SerialNumber::from_token(s).unwrap()),
        )
        .unwrap()
    }

    fn orchestrator(sim: Sim) -> (FlashOrchestrator<SimBus, SimTool>, Rc<RefCell<Sim>>) {
        let _ = env_logger::builder()
            .is_test(true)
            .try_init();
        let shared = Rc::new(RefCell::new(sim));
        let orchestrator = FlashOrchestrator::new(SimBus(Rc::clone(&shared)), SimTool(Rc::clone(&shared)));
        (orchestrator, shared)
    }

    fn run(sim: Sim, plan: &FlashPlan) -> (Result<RunReport>, Vec<Step>, Rc<RefCell<Sim>>) {
        let (mut orchestrator, shared) = orchestrator(sim);
        let mut started = Vec::new();
        let result = orchestrator.run(plan, None, &mut |step| started.push(step));
        (result, started, shared)
    }

    fn position(steps: &[Step], step: Step) -> usize {
        steps
            .iter()
            .position(|s| *s == step)
            .unwrap_or_else(|| panic!("{step} never started"))
    }

    #[test]
    fn test_full_run_order() {
        let (result, started, sim) = run(Sim::default(), &plan(Some("42")));
        let report = result.unwrap();

        let expected = vec![
            Step::LocatePort,
            Step::TriggerBootloader(Core::Primary),
            Step::Upload(Core::Primary),
            Step::AwaitBoot(Core::Primary),
            Step::TriggerBootloader(Core::Secondary),
            Step::PatchSecondary,
            Step::Upload(Core::Secondary),
            Step::AwaitBoot(Core::Secondary),
            Step::Validate,
            Step::Done,
        ];
        assert_eq!(started, expected);
        assert_eq!(report.steps, expected);

        assert!(
            position(&started, Step::PatchSecondary) < position(&started, Step::Upload(Core::Secondary))
        );
        assert!(
            position(&started, Step::AwaitBoot(Core::Primary))
                < position(&started, Step::TriggerBootloader(Core::Secondary))
        );

        let sim = sim.borrow();
        assert_eq!(
            sim.events,
            vec![
                Event::ClearStaging,
                Event::Touch("/dev/ttyACM0".to_string()),
                Event::Write(Core::Primary),
                Event::Touch("/dev/ttyACM0".to_string()),
                Event::Write(Core::Secondary),
                Event::Probe("/dev/ttyACM0".to_string()),
                Event::ClearStaging,
            ]
        );
    }

    #[test]
    fn test_full_run_patches_and_validates() {
        let plan = plan(Some("42"));
        let (result, _, sim) = run(Sim::default(), &plan);
        let report = result.unwrap();

        assert!(report.validated());
        let patch = report.patch.unwrap();
        assert_eq!(patch.previous.value, "DA_2025_001");
        assert_eq!(patch.value, "DA_2025_042");

        let sim = sim.borrow();
        let written = &sim.flash[&Core::Secondary];
        assert_eq!(written.len(), plan.secondary().len());
        assert_eq!(image::locate(written).unwrap().value, "DA_2025_042");
        // The plan keeps the image as shipped.
        assert_eq!(plan.secondary().serial_field().unwrap().value, "DA_2025_001");
        assert_eq!(sim.flash[&Core::Primary], plan.primary().as_bytes());
    }

    #[test]
    fn test_no_board_aborts_without_touching_hardware() {
        let sim = Sim {
            enumerated: false,
            ..Sim::default()
        };
        let (result, started, sim) = run(sim, &plan(Some("42")));
        let err = result.unwrap_err();

        assert!(matches!(err.root(), Error::DeviceNotFound(_)));
        assert_eq!(err.step(), Some(Step::LocatePort));
        assert_eq!(started, vec![Step::LocatePort]);
        assert_eq!(
            sim.borrow().events,
            vec![Event::ClearStaging, Event::ClearStaging]
        );
    }

    #[test]
    fn test_staging_failure_carries_step() {
        let sim = Sim {
            staging_locked: true,
            ..Sim::default()
        };
        let (result, started, sim) = run(sim, &plan(Some("42")));
        let err = result.unwrap_err();

        assert!(matches!(err.root(), Error::Io(_)));
        assert_eq!(err.step(), Some(Step::LocatePort));
        assert_eq!(started, vec![Step::LocatePort]);
        assert!(sim.borrow().events.is_empty());
    }

    #[test]
    fn test_trigger_failure_aborts() {
        let sim = Sim {
            refuse_touch: true,
            ..Sim::default()
        };
        let (result, _, sim) = run(sim, &plan(Some("42")));
        let err = result.unwrap_err();

        assert!(matches!(err.root(), Error::BootloaderEntryFailed { .. }));
        assert_eq!(err.step(), Some(Step::TriggerBootloader(Core::Primary)));
        assert!(sim.borrow().flash.is_empty());
    }

    #[test]
    fn test_primary_write_failure_stops_before_secondary() {
        let sim = Sim {
            fail_write: Some(Core::Primary),
            ..Sim::default()
        };
        let (result, started, sim) = run(sim, &plan(Some("42")));
        let err = result.unwrap_err();

        assert!(matches!(
            err.root(),
            Error::FlashWriteFailed {
                core: Core::Primary,
                ..
            }
        ));
        assert_eq!(err.step(), Some(Step::Upload(Core::Primary)));
        assert!(!started.contains(&Step::TriggerBootloader(Core::Secondary)));
        let touches = sim
            .borrow()
            .events
            .iter()
            .filter(|e| matches!(e, Event::Touch(_)))
            .count();
        assert_eq!(touches, 1);
    }

    #[test]
    fn test_secondary_write_failure_is_fatal() {
        let sim = Sim {
            fail_write: Some(Core::Secondary),
            ..Sim::default()
        };
        let (result, _, sim) = run(sim, &plan(Some("42")));
        let err = result.unwrap_err();

        assert_eq!(err.step(), Some(Step::Upload(Core::Secondary)));
        let sim = sim.borrow();
        assert!(sim.flash.contains_key(&Core::Primary));
        assert!(!sim.flash.contains_key(&Core::Secondary));
        assert!(!sim.events.iter().any(|e| matches!(e, Event::Probe(_))));
        assert_eq!(sim.events.last(), Some(&Event::ClearStaging));
    }

    #[test]
    fn test_unpatchable_secondary_rejected_by_plan() {
        let mut no_marker = secondary_image("DA_2025_001");
        no_marker[64] = b'X';
        let err = FlashPlan::from_images(
            FirmwareImage::from_bytes(vec![0x7E; 128]),
            FirmwareImage::from_bytes(no_marker.clone()),
            Some(SerialNumber::from_token("42").unwrap()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MarkerNotFound));

        // Without a serial number the same image is uploaded as shipped.
        FlashPlan::from_images(
            FirmwareImage::from_bytes(vec![0x7E; 128]),
            FirmwareImage::from_bytes(no_marker),
            None,
        )
        .unwrap();
    }

    #[test]
    fn test_upload_only_run() {
        let plan = plan(None);
        let (result, started, sim) = run(Sim::default(), &plan);
        let report = result.unwrap();

        assert!(!started.contains(&Step::PatchSecondary));
        assert!(report.patch.is_none());
        assert!(report.serial.is_none());
        match report.validation.unwrap() {
            Verdict::Pass(identity) => assert_eq!(identity.serial, "DA_2025_001"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(sim.borrow().flash[&Core::Secondary], plan.secondary().as_bytes());
    }

    #[test]
    fn test_validation_mismatch_is_not_fatal() {
        let sim = Sim {
            reported_serial: Some("DA_2025_099".to_string()),
            ..Sim::default()
        };
        let (result, started, _) = run(sim, &plan(Some("42")));
        let report = result.unwrap();

        assert!(!report.validated());
        assert_eq!(started.last(), Some(&Step::Done));
        match report.validation.unwrap() {
            Verdict::Mismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, "DA_2025_042");
                assert_eq!(actual, "DA_2025_099");
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_board_that_never_boots_times_out() {
        let sim = Sim {
            boots: false,
            ..Sim::default()
        };
        let (result, _, sim) = run(sim, &plan(Some("42")));
        let err = result.unwrap_err();

        assert!(matches!(err.root(), Error::BootTimeout { .. }));
        assert_eq!(err.step(), Some(Step::AwaitBoot(Core::Primary)));
        assert!(!sim.borrow().flash.contains_key(&Core::Secondary));
    }

    #[test]
    fn test_waiting_uses_the_bus_clock() {
        let timing = Timing::default();
        let (mut orchestrator, sim) = orchestrator(Sim::default());
        let mut orchestrator = orchestrator.with_timing(timing);
        orchestrator
            .run(&plan(Some("42")), None, &mut |_| {})
            .unwrap();

        // Two settles, two boots of two misses each (250 + 500 ms) and
        // one boot settle.
        let slept = sim.borrow().slept;
        assert_eq!(
            slept,
            timing.settle * 2 + Duration::from_millis(750) * 2 + timing.boot_settle
        );
    }

    #[test]
    fn test_default_timing_settles_before_writes_and_probe() {
        let timing = Timing::default();
        assert!(timing.settle >= Duration::from_secs(2));
        assert!(timing.boot_settle >= Duration::from_secs(2));

        let sim = Sim {
            boot_polls: 0,
            ..Sim::default()
        };
        let (result, _, sim) = run(sim, &plan(Some("42")));
        assert!(result.unwrap().validated());

        let sim = sim.borrow();
        let waits_before = |event: Event| -> Vec<Duration> {
            let at = sim
                .events
                .iter()
                .position(|e| *e == event)
                .unwrap();
            sim.naps
                .iter()
                .filter(|(i, _)| *i == at)
                .map(|(_, d)| *d)
                .collect()
        };
        assert_eq!(waits_before(Event::Write(Core::Primary)), vec![timing.settle]);
        assert_eq!(waits_before(Event::Write(Core::Secondary)), vec![timing.settle]);
        assert_eq!(
            waits_before(Event::Probe("/dev/ttyACM0".to_string())),
            vec![timing.boot_settle]
        );
    }

    #[test]
    fn test_zero_boot_settle_probes_immediately() {
        let timing = Timing {
            boot_settle: Duration::ZERO,
            ..Timing::default()
        };
        let (orchestrator, sim) = orchestrator(Sim {
            boot_polls: 0,
            ..Sim::default()
        });
        let mut orchestrator = orchestrator.with_timing(timing);
        orchestrator
            .run(&plan(Some("42")), None, &mut |_| {})
            .unwrap();

        assert_eq!(sim.borrow().slept, timing.settle * 2);
    }

    #[test]
    fn test_board_followed_across_reenumeration() {
        let sim = Sim {
            reenumerate_as: Some("/dev/ttyACM3".to_string()),
            ..Sim::default()
        };
        let (result, _, sim) = run(sim, &plan(Some("42")));
        let report = result.unwrap();

        assert_eq!(report.board.path, "/dev/ttyACM3");
        let sim = sim.borrow();
        assert_eq!(sim.events[1], Event::Touch("/dev/ttyACM0".to_string()));
        assert_eq!(sim.events[3], Event::Touch("/dev/ttyACM3".to_string()));
        assert_eq!(sim.events[5], Event::Probe("/dev/ttyACM3".to_string()));
    }

    #[test]
    fn test_pinned_board_ignores_other_boards() {
        let sim = Sim {
            other_board_first: true,
            ..Sim::default()
        };
        let (mut orchestrator, sim) = orchestrator(sim);
        let pinned = BoardPort::from_path("/dev/ttyACM0");
        let report = orchestrator
            .run(&plan(Some("42")), Some(pinned), &mut |_| {})
            .unwrap();

        assert_eq!(report.board.usb_serial.as_deref(), Some("2A0017"));
        assert!(
            !sim.borrow()
                .events
                .iter()
                .any(|e| *e == Event::Touch("/dev/ttyACM9".to_string()))
        );
    }

    #[test]
    fn test_reserialize_reads_patches_writes() {
        let mut sim = Sim::default();
        sim.flash
            .insert(Core::Secondary, secondary_image("DA_2025_001"));
        let (mut orchestrator, sim) = orchestrator(sim);

        let mut started = Vec::new();
        let serial = SerialNumber::from_token("7").unwrap();
        let report = orchestrator
            .reserialize(&serial, None, &mut |step| started.push(step))
            .unwrap();

        assert_eq!(
            started,
            vec![
                Step::LocatePort,
                Step::TriggerBootloader(Core::Secondary),
                Step::ReadBack(Core::Secondary),
                Step::PatchSecondary,
                Step::Upload(Core::Secondary),
                Step::AwaitBoot(Core::Secondary),
                Step::Validate,
                Step::Done,
            ]
        );
        assert!(report.validated());
        assert_eq!(report.patch.unwrap().previous.value, "DA_2025_001");

        let sim = sim.borrow();
        assert_eq!(
            image::locate(&sim.flash[&Core::Secondary])
                .unwrap()
                .value,
            "DA_2025_007"
        );
        assert!(!sim.flash.contains_key(&Core::Primary));
    }

    #[test]
    fn test_reserialize_patch_error_writes_nothing() {
        let mut sim = Sim::default();
        sim.flash
            .insert(Core::Secondary, vec![0xFF; 256]);
        let (mut orchestrator, sim) = orchestrator(sim);

        let serial = SerialNumber::from_token("7").unwrap();
        let err = orchestrator
            .reserialize(&serial, None, &mut |_| {})
            .unwrap_err();

        assert!(matches!(err.root(), Error::MarkerNotFound));
        assert_eq!(err.step(), Some(Step::PatchSecondary));
        assert!(
            !sim.borrow()
                .events
                .iter()
                .any(|e| matches!(e, Event::Write(_)))
        );
    }

    #[test]
    fn test_step_names() {
        assert_eq!(Step::LocatePort.to_string(), "locate port");
        assert_eq!(
            Step::Upload(Core::Secondary).to_string(),
            "upload secondary (M4) image"
        );
        assert_eq!(Step::PatchSecondary.to_string(), "patch secondary image");
    }
}
