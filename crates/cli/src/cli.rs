use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "mfp",
    about = "MFP — turn any Swagger/OpenAPI source into LLM-callable functions",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile swagger sources into function libraries
    Compile {
        /// Parse and validate but don't write output
        #[arg(long)]
        dry_run: bool,
        /// Rewrite generated docstrings through an LLM pass
        #[arg(long)]
        llm_enhance: bool,
    },

    /// Start the MCP server
    Serve {
        /// MCP transport mode
        #[arg(long, value_enum, default_value_t = Transport::Stdio)]
        transport: Transport,
        /// Override host for the HTTP transport
        #[arg(long)]
        host: Option<String>,
        /// Override port for the HTTP transport
        #[arg(long)]
        port: Option<u16>,
    },

    /// Compile then start the MCP server
    Run {
        /// MCP transport mode
        #[arg(long, value_enum, default_value_t = Transport::Stdio)]
        transport: Transport,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    Stdio,
    Http,
}
