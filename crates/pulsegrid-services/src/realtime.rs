//! Arpeggiator split across a control thread and an audio thread
//!
//! The control side owns an [ArpeggiatorHandle]; the audio side owns an
//! [ArpeggiatorProcessor]. Parameters travel through atomics and held-note
//! changes through a bounded queue, so the audio side never blocks.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use pulsegrid_core::{ArpMode, ArpParams, Arpeggiator, ArpeggiatorEvent, MidiEvent};
use tracing::{debug, trace};

use crate::error::{Result, ServiceError};

const COMMAND_QUEUE_SIZE: usize = 256;

/// Arpeggiator parameters readable from the audio thread without locking
#[derive(Debug)]
pub struct SharedArpParams {
    enabled: AtomicBool,
    mode: AtomicU8,
    tempo_sync: AtomicBool,
    rate_raw: AtomicU32,
    gate_raw: AtomicU32,
    octaves: AtomicU8,
}

impl SharedArpParams {
    fn new(params: ArpParams) -> Self {
        Self {
            enabled: AtomicBool::new(params.enabled),
            mode: AtomicU8::new(params.mode.index()),
            tempo_sync: AtomicBool::new(params.tempo_sync),
            rate_raw: AtomicU32::new(params.rate.to_bits()),
            gate_raw: AtomicU32::new(params.gate.to_bits()),
            octaves: AtomicU8::new(params.octaves),
        }
    }

    pub fn load(&self) -> ArpParams {
        ArpParams {
            enabled: self.enabled.load(Ordering::Relaxed),
            mode: ArpMode::from_index(self.mode.load(Ordering::Relaxed)),
            tempo_sync: self.tempo_sync.load(Ordering::Relaxed),
            rate: f32::from_bits(self.rate_raw.load(Ordering::Relaxed)),
            gate: f32::from_bits(self.gate_raw.load(Ordering::Relaxed)),
            octaves: self.octaves.load(Ordering::Relaxed),
        }
    }

    fn store(&self, params: ArpParams) {
        self.mode.store(params.mode.index(), Ordering::Relaxed);
        self.tempo_sync.store(params.tempo_sync, Ordering::Relaxed);
        self.rate_raw.store(params.rate.to_bits(), Ordering::Relaxed);
        self.gate_raw.store(params.gate.to_bits(), Ordering::Relaxed);
        self.octaves.store(params.octaves, Ordering::Relaxed);
        self.enabled.store(params.enabled, Ordering::Relaxed);
    }
}

/// Held-note change sent to the audio thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteCommand {
    Add(u8),
    Remove(u8),
    Clear,
}

/// Create a connected control handle and audio processor
pub fn arpeggiator_channel(params: ArpParams) -> (ArpeggiatorHandle, ArpeggiatorProcessor) {
    let params = params.clamped();
    let shared = Arc::new(SharedArpParams::new(params));
    let (tx, rx) = bounded(COMMAND_QUEUE_SIZE);

    let handle = ArpeggiatorHandle {
        model: Arpeggiator::new(params),
        shared: Arc::clone(&shared),
        commands: tx,
    };
    let processor = ArpeggiatorProcessor {
        arp: Arpeggiator::new(params),
        shared,
        commands: rx,
    };
    (handle, processor)
}

/// Control-thread side.
///
/// Keeps its own copy of the parameters and held notes for display and
/// change notifications; the processor owns the playing state.
#[derive(Debug)]
pub struct ArpeggiatorHandle {
    model: Arpeggiator,
    shared: Arc<SharedArpParams>,
    commands: Sender<NoteCommand>,
}

impl ArpeggiatorHandle {
    pub fn subscribe(&mut self) -> Receiver<ArpeggiatorEvent> {
        self.model.subscribe()
    }

    pub fn params(&self) -> ArpParams {
        self.model.params()
    }

    pub fn held_notes(&self) -> &[u8] {
        self.model.held_notes()
    }

    pub fn shared_params(&self) -> Arc<SharedArpParams> {
        Arc::clone(&self.shared)
    }

    fn send(&self, command: NoteCommand) -> Result<()> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => ServiceError::QueueFull,
            TrySendError::Disconnected(_) => ServiceError::Disconnected,
        })
    }

    pub fn add_note(&mut self, pitch: u8) -> Result<()> {
        self.send(NoteCommand::Add(pitch))?;
        self.model.add_note(pitch);
        Ok(())
    }

    pub fn remove_note(&mut self, pitch: u8) -> Result<()> {
        self.send(NoteCommand::Remove(pitch))?;
        self.model.remove_note(pitch);
        Ok(())
    }

    pub fn clear_notes(&mut self) -> Result<()> {
        self.send(NoteCommand::Clear)?;
        self.model.clear_notes();
        Ok(())
    }

    /// Apply a change to the model and publish the resulting parameters
    fn update(&mut self, change: impl FnOnce(&mut Arpeggiator)) {
        change(&mut self.model);
        self.shared.store(self.model.params());
    }

    pub fn set_params(&mut self, params: ArpParams) {
        self.update(|arp| {
            arp.apply_params(params);
        });
    }

    pub fn is_enabled(&self) -> bool {
        self.model.is_enabled()
    }

    /// Takes effect at the start of the processor's next block
    pub fn set_enabled(&mut self, enabled: bool) {
        debug!(enabled, "arpeggiator enable requested");
        self.update(|arp| {
            arp.set_enabled(enabled);
        });
    }

    pub fn toggle_enabled(&mut self) {
        self.set_enabled(!self.model.is_enabled());
    }

    pub fn set_mode(&mut self, mode: ArpMode) {
        self.update(|arp| arp.set_mode(mode));
    }

    pub fn increment_mode(&mut self) {
        self.update(Arpeggiator::increment_mode);
    }

    pub fn decrement_mode(&mut self) {
        self.update(Arpeggiator::decrement_mode);
    }

    pub fn set_tempo_sync(&mut self, tempo_sync: bool) {
        self.update(|arp| arp.set_tempo_sync(tempo_sync));
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.update(|arp| arp.set_rate(rate));
    }

    pub fn increment_rate(&mut self) {
        self.update(Arpeggiator::increment_rate);
    }

    pub fn decrement_rate(&mut self) {
        self.update(Arpeggiator::decrement_rate);
    }

    pub fn set_gate(&mut self, gate: f32) {
        self.update(|arp| arp.set_gate(gate));
    }

    pub fn increment_gate(&mut self) {
        self.update(Arpeggiator::increment_gate);
    }

    pub fn decrement_gate(&mut self) {
        self.update(Arpeggiator::decrement_gate);
    }

    pub fn set_octaves(&mut self, octaves: u8) {
        self.update(|arp| arp.set_octaves(octaves));
    }

    pub fn increment_octaves(&mut self) {
        self.update(Arpeggiator::increment_octaves);
    }

    pub fn decrement_octaves(&mut self) {
        self.update(Arpeggiator::decrement_octaves);
    }

    pub fn interval_ms(&self) -> f64 {
        self.model.interval_ms()
    }
}

/// Audio-thread side. Never blocks or allocates beyond the returned events.
#[derive(Debug)]
pub struct ArpeggiatorProcessor {
    arp: Arpeggiator,
    shared: Arc<SharedArpParams>,
    commands: Receiver<NoteCommand>,
}

impl ArpeggiatorProcessor {
    /// Render one block.
    ///
    /// Parameter changes are picked up first, so a disable issued before this
    /// call silences the sounding note at offset 0. Queued note changes are
    /// applied next, then the block is scheduled.
    pub fn render(
        &mut self,
        input: &[MidiEvent],
        num_samples: u32,
        sample_rate: f64,
        bpm: f64,
    ) -> Vec<MidiEvent> {
        let mut output = Vec::new();

        let params = self.shared.load();
        if params != self.arp.params() {
            if params.enabled != self.arp.is_enabled() {
                trace!(enabled = params.enabled, "arpeggiator state change at block start");
            }
            output.extend(self.arp.apply_params(params));
        }

        while let Ok(command) = self.commands.try_recv() {
            match command {
                NoteCommand::Add(pitch) => self.arp.add_note(pitch),
                NoteCommand::Remove(pitch) => output.extend(self.arp.remove_note(pitch)),
                NoteCommand::Clear => output.extend(self.arp.clear_notes()),
            }
        }

        output.extend(self.arp.process(input, num_samples, sample_rate, bpm));
        output
    }

    pub fn active_note(&self) -> Option<u8> {
        self.arp.active_note()
    }
}
