use std::io::Write;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;

use toolgate::cli::{self, Invocation, Response};
use toolgate::config::Config;
use toolgate::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(
    name = "toolgate",
    version,
    about = "Invoke a registered tool and print one JSON result line"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List native and registry tool names
    #[arg(long)]
    list: bool,

    /// Tool to run (dashes are treated as underscores)
    #[arg(short, long)]
    tool: Option<String>,

    /// Tool arguments as a JSON object
    #[arg(short, long)]
    args: Option<String>,

    /// Extra engine context as a JSON object
    #[arg(long)]
    context: Option<String>,

    /// Falls back to TOOLGATE_USER_ID
    #[arg(long)]
    user_id: Option<String>,

    /// Falls back to TOOLGATE_CONVERSATION_ID
    #[arg(long)]
    conversation_id: Option<String>,

    /// Falls back to TOOLGATE_AUTH_TOKEN
    #[arg(long)]
    auth_token: Option<String>,
}

async fn handle(cli: Cli) -> Response {
    let config_path = cli
        .config
        .unwrap_or_else(|| toolgate::toolgate_home().join("config.yaml"));
    let config = match Config::load(&config_path).await {
        Ok(c) => c,
        Err(e) => return Response::failure(format!("{e:#}"), cli.tool.as_deref()),
    };
    let orchestrator = Orchestrator::new(config);

    if cli.list {
        return cli::list_tools(orchestrator.registry()).await;
    }

    let invocation = Invocation {
        tool: cli.tool,
        args: cli.args,
        context: cli.context,
        user_id: cli.user_id,
        conversation_id: cli.conversation_id,
        auth_token: cli.auth_token,
    }
    .with_env_fallbacks();

    cli::invoke(&orchestrator, invocation).await
}

#[tokio::main]
async fn main() {
    toolgate::logs::init(toolgate::logs::debug_requested());

    let response = match Cli::try_parse() {
        Ok(cli) => handle(cli).await,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => Response::failure(e.to_string().trim(), None),
    };

    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", response.line());
    let _ = stdout.flush();
    std::process::exit(response.exit_code);
}
