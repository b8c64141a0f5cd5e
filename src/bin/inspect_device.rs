use actimetry::device;
use anyhow::Result;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} <container_file>", args[0]);
        std::process::exit(1);
    }

    let meta = device::read_metadata(Path::new(&args[1]))?;

    println!("\nDevice metadata:");
    println!("{:#?}", meta);

    Ok(())
}
