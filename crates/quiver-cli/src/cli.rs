use clap::{ArgAction, Parser, Subcommand};

pub const QUIVER_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const QUIVER_BEFORE_HELP: &str = concat!(
    "quiver ",
    env!("CARGO_PKG_VERSION"),
    " – isolated environments for wheel-packaged CLI tools\n\n",
    "\x1b[1;36mCore workflow\x1b[0m\n",
    "  list             Show every tool the registry knows, with status.\n",
    "  install          Build (or repair) a tool's isolated environment.\n",
    "  run              Execute a tool inside its environment.\n",
    "  uninstall        Tear a tool's environment down; the archive stays.\n\n",
    "\x1b[1;36mEssentials\x1b[0m\n",
    "  info             Descriptor, environment status, and reconciliation.\n",
    "  doctor           Read-only diagnostics across tools and kits.\n",
    "  clean            Tear down every environment (idempotent).\n\n",
    "\x1b[1;36mKits\x1b[0m\n",
    "  kits             List kit directories and their tool counts.\n",
    "  kit-info         Show the tools inside one kit.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = QUIVER_BEFORE_HELP,
    help_template = QUIVER_HELP_TEMPLATE
)]
pub struct QuiverCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "List every available tool with its environment status.")]
    List,
    #[command(
        about = "Install a tool: create its isolated environment and install its dependencies.",
        override_usage = "quiver install <TOOL>"
    )]
    Install {
        #[arg(
            allow_hyphen_values = true,
            help = "Tool name (as listed by `quiver list`)"
        )]
        tool: String,
    },
    #[command(
        about = "Run an installed tool inside its environment.",
        override_usage = "quiver run <TOOL> [ARG...]"
    )]
    Run {
        #[arg(help = "Tool name")]
        tool: String,
        #[arg(
            trailing_var_arg = true,
            allow_hyphen_values = true,
            help = "Arguments passed through to the tool"
        )]
        args: Vec<String>,
    },
    #[command(about = "Remove a tool's environment; its archive is untouched.")]
    Uninstall {
        #[arg(help = "Tool name")]
        tool: String,
    },
    #[command(about = "Show a tool's metadata, environment status, and dependency state.")]
    Info {
        #[arg(help = "Tool name")]
        tool: String,
    },
    #[command(about = "Run read-only diagnostics across all tools and kits.")]
    Doctor,
    #[command(about = "Tear down every tool environment.")]
    Clean,
    #[command(about = "List available kits.")]
    Kits,
    #[command(about = "Show the tools inside one kit.", name = "kit-info")]
    KitInfo {
        #[arg(help = "Kit name")]
        kit: String,
    },
}
