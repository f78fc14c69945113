use clap::Parser as ClapParser;
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    process,
};

use fabula::{
    Machine, MemoryFileStore, MemorySettings, OptionEntry, Turn, load_image,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The game image to play
    game: PathBuf,

    /// Fix the random number generator for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Collect garbage every N turns (0 disables turn-boundary collection)
    #[arg(long)]
    gc_every: Option<u64>,

    /// Opcodes to run per time slice before yielding
    #[arg(long)]
    slice_budget: Option<u32>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let bytes = match fs::read(&cli.game) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("cannot read {}: {}", cli.game.display(), err);
            process::exit(1);
        }
    };
    let game = match load_image(&bytes) {
        Ok(game) => game,
        Err(err) => {
            eprintln!("not a playable image: {}", err);
            process::exit(1);
        }
    };

    let mut machine = Machine::new(
        game,
        Box::new(MemoryFileStore::new()),
        Box::new(MemorySettings::new()),
    );
    if let Some(seed) = cli.seed {
        machine.seed_rng(seed);
    }
    if let Some(every) = cli.gc_every {
        machine.gc_frequency = every;
    }
    if let Some(budget) = cli.slice_budget {
        machine.slice_budget = budget.max(1);
    }

    if !machine.info.name.is_empty() {
        println!("{} by {}", machine.info.name, machine.info.author);
        println!();
    }

    let mut turn = machine.start();
    loop {
        turn = match turn {
            Turn::Finished { output } => {
                print!("{}", output);
                break;
            }
            Turn::Working => machine.resume_slice(),
            Turn::AwaitingKey { output } => {
                print!("{}", output);
                let line = prompt("[key] ");
                // carriage return when the player just hits enter
                let code = line.chars().next().map(|c| c as i32).unwrap_or(13);
                machine.resume_key(code)
            }
            Turn::AwaitingLine { output } => {
                print!("{}", output);
                let line = prompt("> ");
                machine.resume_line(&line)
            }
            Turn::AwaitingOption { output, options } => {
                print!("{}", output);
                let index = pick_option(&machine, &options);
                machine.resume_option(index)
            }
            Turn::Failed {
                output,
                error,
                dump,
            } => {
                print!("{}", output);
                eprintln!("\nthe game hit a fatal error: {}", error);
                eprint!("{}", dump);
                process::exit(1);
            }
        };
    }
}

fn prompt(text: &str) -> String {
    print!("{}", text);
    let _ = io::stdout().flush();
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        process::exit(1);
    }
    line.trim_end_matches(['\n', '\r']).to_string()
}

fn pick_option(machine: &Machine, options: &[OptionEntry]) -> usize {
    for (i, option) in options.iter().enumerate() {
        let caption = machine
            .heap
            .get_string(option.caption.payload)
            .map(|entry| entry.text.clone())
            .unwrap_or_default();
        println!("  {}) {}", i + 1, caption);
    }
    loop {
        let line = prompt("? ");
        if let Ok(choice) = line.trim().parse::<usize>() {
            if (1..=options.len()).contains(&choice) {
                return choice - 1;
            }
        }
        println!("enter a number from 1 to {}", options.len());
    }
}
