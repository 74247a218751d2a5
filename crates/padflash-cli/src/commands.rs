//! Subcommand implementations

use anyhow::{anyhow, bail, Context, Result};
use padflash_core::patch::encode;
use padflash_core::sysex;
use padflash_core::{
    patch, patch_raw, verify, Catalog, Encoding, FirmwareImage, Model, OptionKey, Palette,
    PatchOptions,
};
use padflash_midi::{
    list_input_ports, list_output_ports, output_port_present, spawn_inquiry_poller, DeviceMonitor,
    FlashError, FlashEvent, FlashEventKind, FlashOrchestrator, MidiPorts, SysExTransport,
    Unconnected,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::config::Config;

/// Load the catalog named by the configuration
pub fn load_catalog(config: &Config) -> Result<Catalog> {
    let path = &config.catalog.manifest;
    let catalog = Catalog::from_file(path)
        .with_context(|| format!("Failed to load firmware catalog {}", path.display()))?;
    info!(models = catalog.entries().len(), "Catalog loaded");
    Ok(catalog)
}

/// Parse `--option` values, rejecting unknown names
pub fn parse_options(names: &[String]) -> Result<PatchOptions> {
    names
        .iter()
        .map(|name| {
            OptionKey::parse(name).ok_or_else(|| {
                let known: Vec<_> = OptionKey::ALL.iter().map(|key| key.flag()).collect();
                anyhow!("Unknown option '{}' (known: {})", name, known.join(", "))
            })
        })
        .collect()
}

fn load_palette(path: Option<&Path>) -> Result<Palette> {
    match path {
        Some(path) => Palette::from_file(path)
            .with_context(|| format!("Failed to load palette {}", path.display())),
        None => Ok(Palette::default()),
    }
}

pub fn models(catalog: &Catalog) {
    for entry in catalog.entries() {
        let model = entry.model;
        let options: Vec<_> = model
            .supported_options()
            .iter()
            .map(|key| key.flag())
            .collect();
        println!("{:<10} {}", model.name(), model.display_name());
        println!("    image:    {:?}", model.class());
        if !options.is_empty() {
            println!("    options:  {}", options.join(", "));
        }
        if let Some(slots) = entry.palette_slots() {
            let required = if entry.palette_required { " (required)" } else { "" };
            println!("    palette:  {} colors{}", slots, required);
        }
        println!("    flash:    {}", if model.is_flashable() { "midi" } else { "download only" });
    }
}

/// Patch a base image and write it to disk
pub fn patch_to_file(
    catalog: &Catalog,
    model: Model,
    options: &[String],
    palette: Option<&Path>,
    output: Option<PathBuf>,
    raw: bool,
) -> Result<()> {
    let options = parse_options(options)?;
    let palette = load_palette(palette)?;

    let image = if raw {
        FirmwareImage::new(model, Encoding::Raw, patch_raw(catalog, model, &options, &palette)?)
    } else {
        patch(catalog, model, &options, &palette)?
    };

    let output = output.unwrap_or_else(|| PathBuf::from(image.file_name()));
    std::fs::write(&output, image.bytes())
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "Wrote {} ({} bytes, sha256 {})",
        output.display(),
        image.len(),
        image.sha256()
    );
    Ok(())
}

/// Identify an uploaded firmware file
pub fn verify_file(catalog: &Catalog, path: &Path) -> Result<Model> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let model = verify(catalog, &bytes)?;
    Ok(model)
}

/// Turn a verified upload into a flashable SysEx image
fn upload_image(catalog: &Catalog, path: &Path) -> Result<FirmwareImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let model = verify(catalog, &bytes)?;
    info!(model = %model, size = bytes.len(), "Verified upload");

    if sysex::split_messages(&bytes).is_some() {
        return Ok(FirmwareImage::new(model, Encoding::SysEx, bytes));
    }
    if model.is_flashable() {
        let entry = catalog.catalog_for(model)?;
        return Ok(encode(entry, &bytes));
    }
    Ok(FirmwareImage::new(model, Encoding::Raw, bytes))
}

/// What to flash
pub enum FlashSource {
    Patch {
        model: Model,
        options: Vec<String>,
        palette: Option<PathBuf>,
    },
    Upload(PathBuf),
}

/// Patch or load an image and flash it over MIDI
pub async fn flash(
    config: &Config,
    catalog: &Catalog,
    source: FlashSource,
    port: Option<String>,
) -> Result<()> {
    let image = match source {
        FlashSource::Patch {
            model,
            options,
            palette,
        } => {
            let options = parse_options(&options)?;
            let palette = load_palette(palette.as_deref())?;
            patch(catalog, model, &options, &palette)?
        }
        FlashSource::Upload(path) => upload_image(catalog, &path)?,
    };
    let target = image.model();
    if !target.is_flashable() {
        bail!(FlashError::NotFlashable(target));
    }

    let midi = config.midi.clone().with_port_override(port);
    if !output_port_present(&midi.output_port).unwrap_or(false) {
        info!(port = %midi.output_port, "No matching MIDI port yet, waiting for the device");
    }

    // The poller opens the ports, and reopens them whenever the device is re-plugged
    let transport: Arc<Mutex<Box<dyn SysExTransport>>> = Arc::new(Mutex::new(Box::new(Unconnected)));
    let monitor = DeviceMonitor::new();
    let poller = spawn_inquiry_poller(
        transport.clone(),
        MidiPorts::new(&midi.output_port, midi.input_port()),
        monitor.clone(),
        midi.inquiry_interval(),
    );

    let orchestrator = FlashOrchestrator::new(
        transport,
        monitor.subscribe(),
        config.flash.to_flash_config(),
    );
    let printer = tokio::spawn(print_events(orchestrator.subscribe()));

    let (cancel, pending) = orchestrator.queue_flash(image, target)?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted");
            cancel.cancel();
        }
    });

    let waited = tokio::time::timeout(config.flash.wait_timeout(), pending.start()).await;

    // Identity requests must not interleave with firmware chunks
    poller.abort();
    let _ = poller.await;

    let result = match waited {
        Err(_) => Err(FlashError::DeviceNotReady),
        Ok(Err(e)) => Err(e),
        Ok(Ok(None)) => Err(FlashError::UserCancelled),
        Ok(Ok(Some(transfer))) => transfer.run().await,
    };
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    match result {
        Ok(report) => {
            println!(
                "Flashed {} ({} bytes in {} chunks, {} retries, {:.1}s)",
                report.model.display_name(),
                report.bytes_sent,
                report.chunks,
                report.retries,
                (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
            );
            Ok(())
        }
        Err(FlashError::UserCancelled) => {
            println!("Flash cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn print_events(mut events: broadcast::Receiver<FlashEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event.kind {
            FlashEventKind::BootloaderPrompt {
                model,
                instructions,
                device_ready,
            } => {
                if device_ready {
                    println!("{} bootloader detected", model.display_name());
                } else {
                    println!("Put your {} in bootloader mode:", model.display_name());
                    println!("  {}", instructions);
                    println!("Waiting for the device (Ctrl-C to cancel)...");
                }
            }
            FlashEventKind::Progress { sent, total } => {
                let percent = if total == 0 { 100 } else { sent * 100 / total };
                print!("\rFlashing... {:>3}% ({}/{} bytes)", percent, sent, total);
                let _ = std::io::stdout().flush();
                if sent == total {
                    println!();
                }
            }
            FlashEventKind::Complete(_) | FlashEventKind::Cancelled => break,
            FlashEventKind::Failed(error) => {
                println!();
                eprintln!("Flash failed: {}", error);
                break;
            }
            FlashEventKind::StateChanged(_) => {}
        }
    }
}

/// Print available MIDI ports
pub fn ports() -> Result<()> {
    println!("Input ports:");
    for name in list_input_ports()? {
        println!("  {}", name);
    }
    println!("Output ports:");
    for name in list_output_ports()? {
        println!("  {}", name);
    }
    Ok(())
}
