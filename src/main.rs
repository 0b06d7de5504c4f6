use clap::{Parser, Subcommand};

use devtree_mirror::config::InspectorConfig;
use devtree_mirror::diagnostics;
use devtree_mirror::replay;
use devtree_mirror::script::ScriptSpec;

pub type Result<T> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "devtree-replay")]
#[command(about = "Replay host tree lifecycle scripts through the inspector pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a script and write what the inspector saw.
    Replay {
        #[arg(long)]
        script: String,

        /// Inspector settings (JSON); defaults apply when omitted.
        #[arg(long)]
        config: Option<String>,

        #[arg(short = 'o', long)]
        out: String,

        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Replay {
            script,
            config,
            out,
            verbose,
        } => {
            diagnostics::init_logging(verbose);

            // 1) Load settings and the script, validating references up front.
            let config = match config {
                Some(path) => InspectorConfig::from_json_file(&path)?,
                None => InspectorConfig::default(),
            };
            let validated = ScriptSpec::from_json_file(&script)?.validate_and_build()?;

            // 2) Play it through agent, relay and client.
            let report = replay::replay(&validated, &config)?;

            // 3) Write the report.
            let json = serde_json::to_string_pretty(&report)?;
            std::fs::write(&out, json)?;
            if !report.converged {
                diagnostics::warn("inspector replica did not converge; see report");
            }
            println!("Wrote {}", out);
        }
    }

    Ok(())
}
