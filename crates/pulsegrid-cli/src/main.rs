//! pulsegrid: headless front end for the step sequencer and arpeggiator

mod config;

use std::str::FromStr;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pulsegrid_core::step_channel::{MAX_CHANNELS, MAX_INTENSITY};
use pulsegrid_core::{ArpMode, MidiEvent, NoteContainer, PulseGridError, SourceId};
use pulsegrid_services::{arpeggiator_channel, ChannelNoteSink, LiveNoteRouter, Session};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{config_path, load_config, save_config, AppConfig};

const BLOCK_SIZE: u64 = 512;

/// The program's command-line arguments.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Arpeggiate held notes and print the scheduled events
    Arp(ArpArgs),
    /// Fill a step grid and print the notes it exports
    Grid(GridArgs),
    /// Show the config file, or write it with the current values
    Config {
        #[clap(long)]
        write: bool,
    },
}

#[derive(clap::Args, Debug)]
struct ArpArgs {
    /// MIDI note numbers to hold
    #[clap(required = true, num_args = 1..)]
    notes: Vec<u8>,
    /// off, up, down, updown or random
    #[clap(long)]
    mode: Option<ArpMode>,
    /// Steps per beat, or per second with --free-running
    #[clap(long)]
    rate: Option<f32>,
    /// Fraction of a step each note sounds for
    #[clap(long)]
    gate: Option<f32>,
    #[clap(long)]
    octaves: Option<u8>,
    #[clap(long)]
    bpm: Option<f64>,
    #[clap(long)]
    sample_rate: Option<u32>,
    /// Ignore the tempo and treat the rate as Hz
    #[clap(long)]
    free_running: bool,
    #[clap(long, default_value_t = 2.0)]
    seconds: f64,
}

#[derive(clap::Args, Debug)]
struct GridArgs {
    /// Cells to set, as channel:step[:intensity]
    #[clap(long = "cell", num_args = 1..)]
    cells: Vec<CellSpec>,
    /// 4, 8 or 16
    #[clap(long)]
    notes_per_measure: Option<usize>,
    #[clap(long, allow_hyphen_values = true)]
    octave: Option<i32>,
    #[clap(long)]
    number_of_notes: Option<usize>,
    #[clap(long)]
    bpm: Option<f64>,
    /// Print the clip as JSON
    #[clap(long)]
    json: bool,
    /// Print the saved grid state as JSON instead of the clip
    #[clap(long, conflicts_with = "json")]
    state: bool,
}

#[derive(Debug, Clone, Copy)]
struct CellSpec {
    channel: usize,
    step: usize,
    intensity: u8,
}

impl FromStr for CellSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let number = |part: &str| {
            part.parse::<usize>()
                .map_err(|e| format!("invalid cell '{s}': {e}"))
        };
        match *parts.as_slice() {
            [channel, step] => Ok(Self {
                channel: number(channel)?,
                step: number(step)?,
                intensity: MAX_INTENSITY,
            }),
            [channel, step, intensity] => Ok(Self {
                channel: number(channel)?,
                step: number(step)?,
                intensity: number(intensity)?.min(usize::from(MAX_INTENSITY)) as u8,
            }),
            _ => Err(format!("invalid cell '{s}', expected channel:step[:intensity]")),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("pulsegrid=info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config();

    match args.command {
        Command::Arp(arp) => run_arp(arp, &config),
        Command::Grid(grid) => run_grid(grid, &config),
        Command::Config { write } => run_config(write, &config),
    }
}

fn print_event(at_sample: u64, sample_rate: u32, event: &MidiEvent) {
    let kind = if event.is_note_off() { "off" } else { "on" };
    println!(
        "{:>9.4}s  {:<3} {:>3}  vel {:>3}",
        at_sample as f64 / f64::from(sample_rate),
        kind,
        event.pitch,
        event.velocity
    );
}

fn run_arp(args: ArpArgs, config: &AppConfig) -> anyhow::Result<()> {
    let mut params = config.arpeggiator.params();
    if let Some(mode) = args.mode {
        params.mode = mode;
    }
    if let Some(rate) = args.rate {
        params.rate = rate;
    }
    if let Some(gate) = args.gate {
        params.gate = gate;
    }
    if let Some(octaves) = args.octaves {
        params.octaves = octaves;
    }
    if args.free_running {
        params.tempo_sync = false;
    }
    let sample_rate = args.sample_rate.unwrap_or(config.transport.sample_rate);
    let bpm = args.bpm.unwrap_or(config.transport.bpm);

    let (mut handle, mut processor) = arpeggiator_channel(params);
    for &note in &args.notes {
        handle.add_note(note)?;
    }
    let params = handle.params();
    info!(
        mode = %params.mode,
        rate = params.rate,
        gate = params.gate,
        octaves = params.octaves,
        tempo_sync = params.tempo_sync,
        bpm,
        "rendering arpeggio"
    );

    let total = (args.seconds.max(0.0) * f64::from(sample_rate)) as u64;
    let (sink, injected) = ChannelNoteSink::new(4096);
    let mut router = LiveNoteRouter::new(sink, SourceId(1));
    let mut rendered = 0u64;

    while rendered < total {
        let frames = (total - rendered).min(BLOCK_SIZE) as u32;
        let events = processor.render(&[], frames, f64::from(sample_rate), bpm);
        for event in &events {
            print_event(rendered + u64::from(event.sample_offset), sample_rate, event);
        }
        router.route(&events);
        rendered += u64::from(frames);
    }

    handle.set_enabled(false);
    let events = processor.render(&[], 1, f64::from(sample_rate), bpm);
    for event in &events {
        print_event(rendered, sample_rate, event);
    }
    router.route(&events);

    let note_ons = injected.try_iter().filter(|n| n.is_note_on).count();
    info!(note_ons, dropped = router.sink().dropped(), "done");
    Ok(())
}

fn run_grid(args: GridArgs, config: &AppConfig) -> anyhow::Result<()> {
    let bpm = args.bpm.unwrap_or(config.transport.bpm);
    let mut session = Session::new(config.transport.sample_rate, bpm);

    let sequencer = session.sequencer_mut();
    sequencer.set_octave(args.octave.unwrap_or(config.sequencer.octave));
    sequencer.set_notes_per_measure(args.notes_per_measure.unwrap_or(config.sequencer.notes_per_measure))?;

    let clip_id = session.new_clip()?;
    let sequencer = session.sequencer_mut();
    if let Some(number_of_notes) = args.number_of_notes {
        sequencer.set_number_of_notes(number_of_notes);
    }

    for cell in &args.cells {
        if cell.channel >= MAX_CHANNELS {
            return Err(PulseGridError::ChannelOutOfRange(cell.channel).into());
        }
        if cell.step >= sequencer.number_of_notes() {
            bail!(
                "step {} is past the last step ({})",
                cell.step,
                sequencer.number_of_notes() - 1
            );
        }
        sequencer.set_note_intensity(cell.channel, cell.step, cell.intensity);
    }
    info!(
        clip = clip_id.0,
        cells = args.cells.len(),
        number_of_notes = sequencer.number_of_notes(),
        notes_per_measure = sequencer.notes_per_measure(),
        "filled step grid"
    );

    let state = sequencer.state();
    let clip = session.close_clip().context("no clip open")?;

    if args.state {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else if args.json {
        println!("{}", serde_json::to_string_pretty(&clip)?);
    } else {
        println!(
            "clip {}  {:.3}s..{:.3}s  {} notes",
            clip.id.0,
            clip.start(),
            clip.end(),
            clip.notes.len()
        );
        for note in clip.notes() {
            println!(
                "  beat {:>7.3}  len {:.3}  pitch {:>3}  vel {:>3}",
                note.start_beat, note.duration_beats, note.pitch, note.velocity
            );
        }
    }
    Ok(())
}

fn run_config(write: bool, config: &AppConfig) -> anyhow::Result<()> {
    if write {
        let path = save_config(config)?;
        info!(path = %path.display(), "config written");
    } else {
        println!("# {}", config_path().display());
        print!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
