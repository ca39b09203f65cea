use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Deserialize)]
pub enum Provider {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "deepseek")]
    Deepseek,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "openai")]
    Openai,
    #[value(name = "nim_minimax_m2", alias = "nim-minimax-m2")]
    #[serde(rename = "nim_minimax_m2", alias = "nim-minimax-m2")]
    NimMinimaxM2,
    #[value(name = "nim_glm47", alias = "nim-glm47")]
    #[serde(rename = "nim_glm47", alias = "nim-glm47")]
    NimGlm47,
}

impl Provider {
    pub fn id(self) -> &'static str {
        match self {
            Provider::Auto => "auto",
            Provider::Deepseek => "deepseek",
            Provider::Qwen => "qwen",
            Provider::Openai => "openai",
            Provider::NimMinimaxM2 => "nim_minimax_m2",
            Provider::NimGlm47 => "nim_glm47",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum SkillCommands {
    #[command(about = "Load every namespace and list the resulting tool set")]
    List,
}

#[derive(Debug, Subcommand)]
pub enum PlanCommands {
    #[command(about = "Print the current task plan and its progress")]
    Show,
    #[command(about = "Delete the current task plan (requires --force)")]
    Clear {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  skillhost run\n\
  skillhost --provider qwen run --web --web-port 5010\n\
  skillhost ask \"Summarize the spreadsheets in ./reports\"\n\
  skillhost skills list\n\
  skillhost plan show\n\
  skillhost plan clear --force\n\
  skillhost doctor\n\
  skillhost telemetry report --limit 2000\n\
\n\
Control inputs (console or web):\n\
  - exit | quit ends the session.\n\
  - __SET_MODEL__:<provider> switches provider and clears history.";

#[derive(Debug, Parser)]
#[command(name = "skillhost")]
#[command(about = "Self-extending automation agent with hot-reloadable skills")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "SKILLHOST_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "SKILLHOST_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "SKILLHOST_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "SKILLHOST_CONFIG", default_value = ".skillhost/config.toml")]
    pub config_path: String,

    #[arg(long, env = "SKILLHOST_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "SKILLHOST_AUTO_SKILLS_DIR")]
    pub auto_skills_dir: Option<String>,

    /// Curated skills mounted under the static namespace; promoted skills land here.
    #[arg(long, env = "SKILLHOST_SKILLS_DIR")]
    pub skills_dir: Option<String>,

    #[arg(long, env = "SKILLHOST_PLAN_PATH")]
    pub plan_path: Option<String>,

    #[arg(long, env = "SKILLHOST_MAX_AUTO_STEPS")]
    pub max_auto_steps: Option<usize>,

    #[arg(long, env = "SKILLHOST_MAX_TOOL_ROUNDS")]
    pub max_tool_rounds: Option<usize>,

    #[arg(long, env = "SKILLHOST_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, env = "SKILLHOST_COMPACT_THRESHOLD")]
    pub compact_threshold: Option<usize>,

    #[arg(long, env = "SKILLHOST_COMPACT_KEEP_RECENT")]
    pub compact_keep_recent: Option<usize>,

    #[arg(long, env = "SKILLHOST_TEMPERATURE")]
    pub temperature: Option<f32>,

    #[arg(long, env = "SKILLHOST_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "SKILLHOST_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the interactive agent loop (console, and optionally the web console)")]
    Run {
        #[arg(long, env = "SKILLHOST_WEB", default_value_t = false)]
        web: bool,
        #[arg(long, env = "SKILLHOST_WEB_HOST", default_value = "127.0.0.1")]
        web_host: String,
        #[arg(long, env = "SKILLHOST_WEB_PORT", default_value_t = 5010)]
        web_port: u16,
        #[arg(long, default_value_t = false)]
        no_console: bool,
    },
    #[command(about = "Run one auto-continued task and exit")]
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    #[command(about = "Inspect loaded skills")]
    Skills {
        #[command(subcommand)]
        command: SkillCommands,
    },
    #[command(about = "Inspect or reset the persisted task plan")]
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    #[command(about = "Validate provider environment and skill directories")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Run { .. } => "run".to_string(),
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Skills { command } => match command {
            SkillCommands::List => "skills.list".to_string(),
        },
        Commands::Plan { command } => match command {
            PlanCommands::Show => "plan.show".to_string(),
            PlanCommands::Clear { .. } => "plan.clear".to_string(),
        },
        Commands::Doctor => "doctor".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
