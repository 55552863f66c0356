use std::{env, error::Error, fs, path::Path, path::PathBuf, process};

use loopy::emulator::{Emulator, SystemConfig};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let mut positional: Vec<PathBuf> = Vec::new();
    let mut frames = 600usize;
    let mut dump = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                let Some(value) = args.next() else {
                    eprintln!("--frames requires a value");
                    process::exit(1);
                };
                match value.parse::<usize>() {
                    Ok(count) => frames = count,
                    Err(_) => {
                        eprintln!("invalid --frames value: {value}");
                        process::exit(1);
                    }
                }
            }
            "--dump" => dump = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other if !other.starts_with('-') => positional.push(PathBuf::from(other)),
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                process::exit(1);
            }
        }
    }

    if positional.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let cart_path = positional[0].clone();
    let bios_path = positional[1].clone();
    let sound_path = positional.get(2).cloned();

    let cart_rom = read_rom(&cart_path);
    let bios_rom = read_rom(&bios_path);
    let sound_rom = sound_path.map(|path| read_rom(&path));

    // SRAM loads from a sibling .sav; absence just means a fresh cart.
    let sav_path = cart_path.with_extension("sav");
    let cart_sram = fs::read(&sav_path).unwrap_or_default();

    let config = SystemConfig {
        bios_rom,
        cart_rom,
        cart_sram,
        sram_file_path: sav_path.to_str().map(str::to_string),
        sound_rom,
        ..Default::default()
    };

    let mut emulator = match Emulator::new(config) {
        Ok(emulator) => emulator,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    // Headless run; the audio engine (if any) stays idle without a device,
    // which keeps the machine running silently.
    for _ in 0..frames {
        emulator.run_frame();
    }

    emulator.shutdown();

    if dump {
        emulator.write_debug_dump("emudump.bin")?;
    }

    Ok(())
}

fn read_rom(path: &Path) -> Vec<u8> {
    match fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("Failed to open {}: {err}", path.display());
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: loopy <game-rom> <bios-rom> [sound-rom] [--frames <n>] [--dump]");
    eprintln!("  <game-rom>   : raw cartridge image; SRAM persists to the sibling .sav");
    eprintln!("  <bios-rom>   : 32 KiB BIOS image");
    eprintln!("  [sound-rom]  : optional uPD937 sound ROM; omitting it mutes the synth");
    eprintln!("Options:");
    eprintln!("  --frames <n>  Number of frames to emulate before exiting (default 600)");
    eprintln!("  --dump        Write emudump.bin (VRAM/palette/OAM regions) at exit");
    eprintln!("  --help        Show this message");
}
