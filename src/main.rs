use chip8_vm::emulator::Emulator;
use chip8_vm::state::Settings;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // The terminal belongs to the UI, so logs go to stderr. Only errors unless RUST_LOG says otherwise.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::parse();
    let mut emulator = Emulator::new(settings);

    emulator.run()?;

    Ok(())
}
