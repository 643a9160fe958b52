use clap::Parser;
use log::{info, warn};
use nrsc5_core::nrsc5_mode::Mode;
use nrsc5_radio::events::Event;
use nrsc5_radio::output::AdtsWriter;
use nrsc5_radio::Receiver;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "NRSC-5 HD Radio receiver", long_about = None)]
struct AppArguments {
    /// Waveform mode. Valid modes are "fm" and "am".
    #[arg(short, long, default_value = "fm")]
    mode: String,
    /// Read unsigned 8-bit IQ samples from this file instead of a device.
    /// Use "-" for stdin.
    #[arg(short = 'r', long)]
    iq_input: Option<String>,
    /// Connect to an rtl_tcp server at host:port.
    #[arg(short = 'H', long)]
    rtltcp: Option<String>,
    /// Copy raw IQ samples to this file while receiving.
    #[arg(short = 'w', long)]
    iq_output: Option<String>,
    /// Write the selected program's HDC stream as ADTS to this file.
    #[arg(short = 'o', long)]
    audio_output: Option<String>,
    /// Audio program number to dump.
    #[arg(long, default_value_t = 0)]
    program: u32,
    /// Tuner gain in dB; omit for automatic gain.
    #[arg(short, long)]
    gain: Option<f32>,
    /// Frequency correction in parts per million.
    #[arg(short, long, default_value_t = 0)]
    ppm: i32,
    /// Enable the bias tee.
    #[arg(long)]
    bias_tee: bool,
    /// Enable direct sampling.
    #[arg(long)]
    direct_sampling: bool,
    /// Station frequency in Hz (required with --rtltcp).
    frequency: Option<f64>,
}

fn parse_mode(name: &str) -> Result<Mode, String> {
    match name {
        "fm" => Ok(Mode::Fm),
        "am" => Ok(Mode::Am),
        other => Err(format!("Invalid mode: {}", other)),
    }
}

fn main() -> Result<(), String> {
    env_logger::init();
    let args = AppArguments::parse();
    let mode = parse_mode(&args.mode)?;

    let mut audio_writer = match &args.audio_output {
        None => None,
        Some(path) => match File::create(path) {
            Ok(file) => Some(AdtsWriter::new(BufWriter::new(file))),
            Err(err) => return Err(format!("Failed to open audio output {}: {}", path, err)),
        },
    };
    let mut iq_writer: Option<BufWriter<File>> = match &args.iq_output {
        None => None,
        Some(path) => match File::create(path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => return Err(format!("Failed to open IQ output {}: {}", path, err)),
        },
    };

    let running = Arc::new(AtomicBool::new(true));
    ctrlc::set_handler({
        let running = running.clone();
        move || running.store(false, Ordering::SeqCst)
    })
    .map_err(|err| format!("Failed to install signal handler: {}", err))?;

    let program = args.program;
    let handler = move |event: &Event<'_>| match event {
        Event::Sync { psmi } => info!("Synchronized (PSMI {})", psmi),
        Event::LostSync => info!("Lost synchronization"),
        Event::LostDevice => warn!("Lost device"),
        Event::Mer { lower_db, upper_db } => {
            info!("MER: {:.1} dB (lower), {:.1} dB (upper)", lower_db, upper_db)
        }
        Event::Ber { cber } => info!("BER: {:.6}", cber),
        Event::Psmi { psmi } => info!("Primary service mode: {}", psmi),
        Event::Hdc { program: prog, data } => {
            if *prog == program {
                if let Some(writer) = audio_writer.as_mut() {
                    if let Err(err) = writer.push(data) {
                        warn!("Audio output failed: {}", err);
                    }
                }
            }
        }
        Event::Iq { data } => {
            if let Some(writer) = iq_writer.as_mut() {
                if let Err(err) = writer.write_all(data) {
                    warn!("IQ output failed: {}", err);
                }
            }
        }
        Event::Id3 { program: prog, data } => {
            info!("ID3 for program {}: {} bytes", prog, data.len())
        }
        Event::Sis { info } => {
            if let (Some(country), Some(id)) = (&info.country_code, info.fcc_facility_id) {
                info!("Station: {} (facility {})", country, id);
            }
            if let Some(name) = &info.name {
                info!("Name: {}", name);
            }
            if let Some(slogan) = &info.slogan {
                info!("Slogan: {}", slogan);
            }
            if let Some(message) = &info.message {
                info!("Message: {}", message);
            }
            if let Some(alert) = &info.alert {
                warn!("ALERT: {}", alert);
            }
            if let (Some(lat), Some(lon)) = (info.latitude, info.longitude) {
                info!("Location: {:.4}, {:.4} (altitude {})", lat, lon, info.altitude);
            }
            for asd in &info.audio_services {
                info!(
                    "Audio service {}: {}",
                    asd.program,
                    nrsc5_radio::events::program_type_name(asd.service_type)
                );
            }
        }
        _ => {}
    };

    if let Some(addr) = &args.rtltcp {
        let frequency = args
            .frequency
            .ok_or_else(|| "A frequency is required with --rtltcp".to_string())?;
        let stream = TcpStream::connect(addr)
            .map_err(|err| format!("Failed to connect to {}: {}", addr, err))?;
        let receiver = Receiver::open_rtltcp(stream)
            .map_err(|err| format!("Failed to open rtl_tcp session: {}", err))?;
        receiver.set_callback(handler);

        receiver
            .set_frequency(frequency)
            .map_err(|err| format!("Failed to tune: {}", err))?;
        receiver
            .set_mode(mode)
            .map_err(|err| format!("Failed to set mode: {}", err))?;
        if let Some(gain) = args.gain {
            receiver
                .set_gain(gain)
                .map_err(|err| format!("Failed to set gain: {}", err))?;
            receiver.set_auto_gain(false);
        }
        if args.ppm != 0 {
            receiver
                .set_freq_correction(args.ppm)
                .map_err(|err| format!("Failed to set ppm: {}", err))?;
        }
        if args.bias_tee {
            receiver
                .set_bias_tee(true)
                .map_err(|err| format!("Failed to enable bias tee: {}", err))?;
        }
        if args.direct_sampling {
            receiver
                .set_direct_sampling(true)
                .map_err(|err| format!("Failed to enable direct sampling: {}", err))?;
        }

        receiver.start();
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        receiver.stop();
        return Ok(());
    }

    // File or stdin input is pushed through the pipe interface from this
    // thread; backpressure comes from the sample ring.
    let mut input: Box<dyn Read> = match args.iq_input.as_deref() {
        None | Some("-") => Box::new(std::io::stdin()),
        Some(path) => match File::open(path) {
            Ok(file) => Box::new(file),
            Err(err) => return Err(format!("Failed to open input file {}: {}", path, err)),
        },
    };

    let mut receiver = Receiver::open_pipe();
    receiver.set_callback(handler);
    receiver
        .set_mode(mode)
        .map_err(|err| format!("Failed to set mode: {}", err))?;
    receiver.start();

    let mut buffer = vec![0u8; 128 * 1024];
    while running.load(Ordering::SeqCst) {
        match input.read(&mut buffer) {
            Ok(0) => {
                info!("Finished reading samples from input");
                break;
            }
            Ok(count) => receiver.pipe_samples_cu8(&buffer[..count]),
            Err(err) => return Err(format!("Error while reading from input: {}", err)),
        }
    }

    receiver.stop();
    Ok(())
}
