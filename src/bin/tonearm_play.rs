//! Command-line demo player
//!
//! Plays the given audio files in order through the full pipeline:
//!
//! ```text
//! tonearm-play first.flac second.mp3 --volume 0.8
//! ```
//!
//! The playlist is served to the player through the same [`SongSource`]
//! seam an embedding host would implement, so this doubles as a reference
//! integration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tonearm::audio::AudioOutput;
use tonearm::{MediaFile, Player, PlayerConfig, PlayerEvent, SongDesc, SongId, SongSource};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tonearm-play")]
#[command(about = "Plays audio files through the tonearm pipeline")]
#[command(version)]
struct Args {
    /// Audio files to play, in order
    #[arg(required_unless_present = "list_devices")]
    files: Vec<PathBuf>,

    /// Master volume in [0, 1]
    #[arg(short, long)]
    volume: Option<f32>,

    /// Output device name (default: system default output)
    #[arg(short, long, env = "TONEARM_DEVICE")]
    device: Option<String>,

    /// Optional TOML config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

/// Serves the command-line files in order.
///
/// The cursor tracks the currently playing song via `SongChanged` events,
/// so `upcoming_songs` always describes what really comes next even when
/// the player advances through pre-opened peeks without calling
/// `next_song`.
struct PlaylistSource {
    songs: Vec<SongDesc>,
    next: AtomicUsize,
}

impl PlaylistSource {
    fn new(files: &[PathBuf]) -> Self {
        let songs = files
            .iter()
            .map(|path| {
                let label = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("unknown")
                    .to_string();
                SongDesc::new(label, Arc::new(MediaFile::new(path.clone())))
            })
            .collect();
        PlaylistSource {
            songs,
            next: AtomicUsize::new(0),
        }
    }

    fn advance_to(&self, song: SongId) {
        if let Some(pos) = self.songs.iter().position(|s| s.id == song) {
            self.next.store(pos + 1, Ordering::Relaxed);
        }
    }
}

impl SongSource for PlaylistSource {
    fn next_song(&self) -> Option<SongDesc> {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.songs.get(i).cloned()
    }

    fn upcoming_songs(&self, count: usize) -> Vec<SongDesc> {
        let i = self.next.load(Ordering::Relaxed);
        self.songs.iter().skip(i).take(count).cloned().collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tonearm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in AudioOutput::list_devices().context("failed to enumerate devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => PlayerConfig::from_toml_path(path).context("failed to load config")?,
        None => PlayerConfig::default(),
    };
    if let Some(volume) = args.volume {
        config.volume = volume;
    }
    if args.device.is_some() {
        config.device_name = args.device.clone();
    }

    let source = Arc::new(PlaylistSource::new(&args.files));
    let total = args.files.len();
    let player = Player::new(config, Arc::clone(&source) as Arc<dyn SongSource>)
        .context("failed to start player")?;
    let mut events = player.subscribe();
    player.play();
    info!(files = total, "playlist started");

    let mut done = 0usize;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(PlayerEvent::SongChanged { new: Some(song), .. }) => {
                    source.advance_to(song);
                }
                Ok(PlayerEvent::SongFinished { .. }) | Ok(PlayerEvent::SongFailed { .. }) => {
                    done += 1;
                    if done >= total {
                        info!("playlist finished");
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    // Let the pause ramp render before tearing the stream down.
    player.pause();
    tokio::time::sleep(Duration::from_millis(150)).await;
    Ok(())
}
