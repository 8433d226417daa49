//! Bastion CLI - policy and access tooling
//!
//! Inspects and validates policy matrices, normalizes routes, and evaluates
//! access decisions offline against a fixtures file.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use bastion_core::tenancy::{
    normalize_route, AccessDecision, AccessService, Action, EntityRegistry, InMemoryMembershipStore,
    MembershipFixtures, OrganizationId, PlatformRole, PolicyMatrix, Resolution, Role, RoleResolver,
    ScopedAccessGuard, TenantContext, UserId, WorkspaceId,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "bastion",
    version,
    about = "Bastion - multi-tenant authorization tooling",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Policy file; the built-in matrix is used when omitted
    #[arg(short, long, global = true, env = "BASTION__POLICY__PATH")]
    policy: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Policy matrix operations
    #[command(subcommand)]
    Policy(PolicyCommands),

    /// Normalize one or more routes to their policy form
    Route {
        routes: Vec<String>,
    },

    /// Evaluate one access decision against a fixtures file
    Evaluate {
        /// Fixtures file with workspaces and memberships
        #[arg(long, env = "BASTION__FIXTURES__PATH")]
        fixtures: PathBuf,

        #[arg(long)]
        user: String,

        #[arg(long)]
        organization: String,

        #[arg(long)]
        workspace: String,

        /// read, create, update, delete, comment, assign, invite, manage, execute
        #[arg(long)]
        action: String,

        #[arg(long)]
        route: String,

        #[arg(long, default_value = "member")]
        platform_role: String,
    },

    /// Show a user's effective role in every workspace of the fixtures
    Roles {
        #[arg(long, env = "BASTION__FIXTURES__PATH")]
        fixtures: PathBuf,

        #[arg(long)]
        user: String,

        #[arg(long)]
        organization: String,

        #[arg(long, default_value = "member")]
        platform_role: String,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Print the rules of the active matrix
    Show {
        /// Only rules for this role
        #[arg(short, long)]
        role: Option<String>,
    },

    /// Load a policy file and check it, including role monotonicity
    Validate {
        file: PathBuf,
    },

    /// List what a role may do on a route
    Explain {
        #[arg(long)]
        role: String,

        #[arg(long)]
        route: String,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Display Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Tabled)]
struct RuleRow {
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Route")]
    route: String,
    #[tabled(rename = "Actions")]
    actions: String,
}

#[derive(Debug, Serialize, Tabled)]
struct RouteRow {
    #[tabled(rename = "Input")]
    input: String,
    #[tabled(rename = "Normalized")]
    normalized: String,
}

#[derive(Debug, Serialize, Tabled)]
struct RoleRow {
    #[tabled(rename = "Workspace")]
    workspace: String,
    #[tabled(rename = "Organization")]
    organization: String,
    #[tabled(rename = "Effective Role")]
    role: String,
    #[tabled(rename = "Resolution")]
    resolution: String,
}

#[derive(Debug, Serialize)]
struct EvaluationReport {
    user: String,
    organization: String,
    workspace: String,
    action: Action,
    route: String,
    decision: AccessDecision,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn print_success(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "status": "success", "message": message }));
            }
            OutputFormat::Table => {
                println!("{} {}", "[OK]".green().bold(), message);
            }
        }
    }

    fn print_error(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                eprintln!("{}", serde_json::json!({ "status": "error", "message": message }));
            }
            OutputFormat::Table => {
                eprintln!("{} {}", "[ERROR]".red().bold(), message);
            }
        }
    }

    fn print_rows<T: Tabled + Serialize>(&self, items: &[T]) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(&items),
            OutputFormat::Table => {
                if items.is_empty() {
                    println!("{}", "No results found.".dimmed());
                    return Ok(());
                }
                let table = Table::new(items)
                    .with(Style::rounded())
                    .with(Modify::new(Columns::first()).with(Alignment::left()))
                    .to_string();
                println!("{}", table);
                Ok(())
            }
        }
    }

    fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        println!("{}", json);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

fn load_policy(path: Option<&Path>) -> Result<PolicyMatrix> {
    Ok(match path {
        Some(path) => PolicyMatrix::from_file(path)?,
        None => PolicyMatrix::default_matrix(),
    })
}

fn rule_rows(matrix: &PolicyMatrix, role: Option<Role>) -> Vec<RuleRow> {
    matrix
        .rules()
        .into_iter()
        .filter(|rule| role.map_or(true, |r| rule.role == r))
        .map(|rule| RuleRow {
            role: rule.role.to_string(),
            route: rule.route,
            actions: rule.actions.to_string(),
        })
        .collect()
}

fn handle_policy_command(cmd: PolicyCommands, policy: Option<&Path>, output: &OutputHelper) -> Result<()> {
    match cmd {
        PolicyCommands::Show { role } => {
            let matrix = load_policy(policy)?;
            let role = role.map(|r| r.parse::<Role>()).transpose()?;
            output.print_rows(&rule_rows(&matrix, role))
        }
        PolicyCommands::Validate { file } => {
            let matrix = PolicyMatrix::from_file(&file)?;
            output.print_success(&format!(
                "{} is valid ({} rules)",
                file.display(),
                matrix.rules().len()
            ));
            Ok(())
        }
        PolicyCommands::Explain { role, route } => {
            let matrix = load_policy(policy)?;
            let role: Role = role.parse()?;
            let normalized = normalize_route(&route);
            let allowed = matrix.allowed_actions(role, &route);
            let rows = vec![RuleRow {
                role: role.to_string(),
                route: normalized,
                actions: allowed.to_string(),
            }];
            output.print_rows(&rows)
        }
    }
}

fn handle_route_command(routes: Vec<String>, output: &OutputHelper) -> Result<()> {
    let rows: Vec<RouteRow> = routes
        .into_iter()
        .map(|input| RouteRow {
            normalized: normalize_route(&input),
            input,
        })
        .collect();
    output.print_rows(&rows)
}

fn access_service(fixtures: &MembershipFixtures, policy: PolicyMatrix) -> AccessService {
    let store = Arc::new(InMemoryMembershipStore::from_fixtures(fixtures.clone()));
    let guard = ScopedAccessGuard::new(Arc::new(EntityRegistry::standard()));
    AccessService::new(RoleResolver::new(store), Arc::new(policy), guard)
}

fn context(user: &str, organization: &str, workspace: Option<&str>, platform_role: &str) -> Result<TenantContext> {
    Ok(TenantContext::establish(
        UserId::new(user),
        Some(OrganizationId::new(organization)),
        workspace.map(WorkspaceId::new),
        platform_role.parse::<PlatformRole>()?,
    )?)
}

#[allow(clippy::too_many_arguments)]
async fn handle_evaluate(
    fixtures: PathBuf,
    user: String,
    organization: String,
    workspace: String,
    action: String,
    route: String,
    platform_role: String,
    policy: Option<&Path>,
    output: &OutputHelper,
) -> Result<()> {
    let fixtures = MembershipFixtures::from_file(&fixtures)?;
    let access = access_service(&fixtures, load_policy(policy)?);
    let ctx = context(&user, &organization, Some(&workspace), &platform_role)?;
    let action: Action = action.parse()?;
    let workspace_id = WorkspaceId::new(workspace.as_str());

    let decision = access.evaluate(&ctx, &workspace_id, action, &route).await;

    match output.format {
        OutputFormat::Json => output.print_json(&EvaluationReport {
            user,
            organization,
            workspace,
            action,
            route,
            decision,
        }),
        OutputFormat::Table => {
            let verdict = if decision.allowed {
                "ALLOW".green().bold()
            } else {
                "DENY".red().bold()
            };
            println!("{} {} {} on {} in {}", verdict, user, action, route, workspace);
            println!("  reason: {}", decision.reason);
            if let Some(required) = decision.required_role {
                println!("  required role: {}", required);
            }
            Ok(())
        }
    }
}

async fn handle_roles(
    fixtures: PathBuf,
    user: String,
    organization: String,
    platform_role: String,
    policy: Option<&Path>,
    output: &OutputHelper,
) -> Result<()> {
    let fixtures = MembershipFixtures::from_file(&fixtures)?;
    let access = access_service(&fixtures, load_policy(policy)?);
    let ctx = context(&user, &organization, None, &platform_role)?;

    let mut rows = Vec::with_capacity(fixtures.workspaces.len());
    for workspace in &fixtures.workspaces {
        let resolution = access.resolver().resolve_detailed(&ctx, &workspace.id).await;
        let (role, detail) = match &resolution {
            Resolution::Granted(role) => (role.to_string(), "granted".to_string()),
            Resolution::Denied(reason) => ("-".to_string(), reason.to_string()),
            Resolution::WorkspaceNotFound => ("-".to_string(), "workspace_not_found".to_string()),
            Resolution::Unavailable => ("-".to_string(), "store_unavailable".to_string()),
        };
        rows.push(RoleRow {
            workspace: workspace.id.to_string(),
            organization: workspace.organization_id.to_string(),
            role,
            resolution: detail,
        });
    }
    output.print_rows(&rows)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);
    let policy = cli.policy.as_deref();

    let result = match cli.command {
        Commands::Policy(cmd) => handle_policy_command(cmd, policy, &output),
        Commands::Route { routes } => handle_route_command(routes, &output),
        Commands::Evaluate {
            fixtures,
            user,
            organization,
            workspace,
            action,
            route,
            platform_role,
        } => {
            handle_evaluate(
                fixtures,
                user,
                organization,
                workspace,
                action,
                route,
                platform_role,
                policy,
                &output,
            )
            .await
        }
        Commands::Roles {
            fixtures,
            user,
            organization,
            platform_role,
        } => handle_roles(fixtures, user, organization, platform_role, policy, &output).await,
    };

    if let Err(e) = result {
        output.print_error(&e.to_string());
        std::process::exit(1);
    }
}
