//! medgate CLI - operator tooling for the hospital access gate
//!
//! Run `medgate --help` for usage information.

use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use medgate::audit::{AuditFilter, AuditStatus, DateRange, EventType, PageRequest};
use medgate::auth::{PasswordHasher, ROLE_ADMIN};
use medgate::config::Config;
use medgate::logging::init_logging;
use medgate::{Actor, Medgate, RequestContext};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    name = "medgate",
    about = "Role-based access control gate for a hospital record-keeping API",
    version
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file, seed roles and permissions, create an admin
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,

        /// Username for the initial administrator
        #[arg(long, default_value = "admin")]
        admin: String,
    },

    /// Print a bcrypt digest for a password (prompts if omitted)
    HashPassword { password: Option<String> },

    /// Log in and print the session token
    Login {
        #[arg(short, long)]
        username: String,

        /// Password (will prompt if not provided)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Verify a session token and print its claims
    VerifyToken { token: String },

    /// Manage user accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage roles
    Role {
        #[command(subcommand)]
        command: RoleCommands,
    },

    /// Inspect and edit role permissions
    Permission {
        #[command(subcommand)]
        command: PermissionCommands,
    },

    /// Query the audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Add {
        #[arg(short, long)]
        username: String,

        /// Role name (Admin, Doctor, Receptionist, Nurse or a custom role)
        #[arg(short, long)]
        role: String,

        /// Password (will prompt if not provided)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// List users
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Change a user's role
    SetRole { username: String, role: String },

    /// Deactivate a user; the account is kept but can no longer log in
    Deactivate { username: String },
}

#[derive(Subcommand)]
enum RoleCommands {
    /// Create a role
    Add {
        name: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// List roles with their user counts
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Delete a role that no user references
    Delete { name: String },
}

#[derive(Subcommand)]
enum PermissionCommands {
    /// Show the role x resource permission matrix
    Matrix {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// List the permissions granted to one role
    List { role: String },

    /// Grant an action on a resource to a role
    Grant {
        #[arg(short, long)]
        role: String,
        #[arg(long)]
        resource: String,
        #[arg(short, long)]
        action: String,
    },

    /// Revoke an action on a resource from a role
    Revoke {
        #[arg(short, long)]
        role: String,
        #[arg(long)]
        resource: String,
        #[arg(short, long)]
        action: String,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// List audit events, newest first
    Logs {
        /// Event type (LOGIN, LOGOUT, SELECT, INSERT, UPDATE, DELETE, GRANT, REVOKE)
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,

        /// Match against username or resource
        #[arg(short, long)]
        search: Option<String>,

        /// today, week, month or all
        #[arg(short, long, default_value = "all")]
        range: String,

        /// success, failed or denied
        #[arg(long)]
        status: Option<String>,

        #[arg(short, long)]
        limit: Option<u64>,

        #[arg(short, long, default_value_t = 0)]
        offset: u64,
    },

    /// Most recent failed logins
    FailedLogins {
        #[arg(short, long, default_value_t = 20)]
        limit: u64,
    },

    /// Security alerts over the configured windows
    Alerts,

    /// Aggregate counters
    Stats {
        /// today, week, month or all
        #[arg(short, long, default_value = "all")]
        range: String,
    },
}

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    let command = match cli.command {
        Commands::Init { force, admin } => {
            init_logging(&Config::default().logging, cli.verbose);
            return init_config(&config_path, force, &admin).await;
        }
        command => command,
    };

    let config = if config_path.exists() {
        Config::load(&config_path).await?
    } else {
        Config::default().with_env_overrides()?
    };
    init_logging(&config.logging, cli.verbose);

    match command {
        Commands::Init { .. } => {}
        Commands::HashPassword { password } => {
            let password = password_or_prompt(password, "Password: ")?;
            let hasher = PasswordHasher::new(config.password.bcrypt_cost)?;
            println!("{}", hasher.hash(&password)?);
        }
        Commands::Login { username, password } => {
            let medgate = Medgate::open(&config).await?;
            let password = password_or_prompt(password, "Password: ")?;
            let (token, user) = medgate
                .auth
                .authenticate(&username, &password, &RequestContext::new())
                .await?;
            print_json(&serde_json::json!({ "token": token, "user": user }))?;
        }
        Commands::VerifyToken { token } => {
            let medgate = Medgate::open(&config).await?;
            let claims = medgate.gate.verify(&token)?;
            print_json(&claims)?;
        }
        Commands::User { command } => user_command(&config, command).await?,
        Commands::Role { command } => role_command(&config, command).await?,
        Commands::Permission { command } => permission_command(&config, command).await?,
        Commands::Audit { command } => audit_command(&config, command).await?,
    }

    Ok(())
}

fn operator() -> Actor {
    Actor::system(format!(
        "cli:{}",
        std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
    ))
}

fn password_or_prompt(password: Option<String>, prompt: &str) -> CliResult<String> {
    if let Some(password) = password {
        return Ok(password);
    }

    eprint!("{}", prompt);
    io::stderr().flush()?;
    Ok(rpassword::read_password()?)
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn init_config(config_path: &Path, force: bool, admin: &str) -> CliResult {
    if config_path.exists() && !force {
        return Err(format!(
            "Configuration already exists at {}. Use --force to overwrite.",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut secret = [0u8; 48];
    OsRng.fill_bytes(&mut secret);

    let content = format!(
        r#"# medgate configuration

[token]
# HS256 signing secret; MEDGATE_TOKEN_SECRET overrides it
secret = "{secret}"
ttl_hours = 24

[password]
bcrypt_cost = 12

[audit]
default_page_size = 50
max_page_size = 500
failed_login_threshold = 3
high_severity_threshold = 5
failed_login_window_hours = 24
resource_spread_threshold = 5
resource_spread_window_minutes = 60

[storage]
backend = "file"

[storage.file]
path = "{path}"

# [storage.postgres]
# url = "postgres://medgate@localhost/hospital"  # or MEDGATE_DATABASE_URL
# max_connections = 10

[network]
# Reverse proxies allowed to report the client address (X-Forwarded-For)
trusted_proxies = []

[logging]
level = "info"
format = "pretty"
"#,
        secret = STANDARD.encode(secret),
        path = Config::default_storage_path().display(),
    );

    tokio::fs::write(config_path, content).await?;
    println!("Configuration initialized at {}", config_path.display());

    let config = Config::load(config_path).await?;
    let medgate = Medgate::open(&config).await?;
    let report = medgate.permissions.seed_defaults().await?;
    println!(
        "Seeded {} roles, {} permissions, {} grants",
        report.roles_created, report.permissions, report.grants_added
    );

    if medgate.storage.get_user_by_username(admin).await?.is_some() {
        println!("User '{}' already exists; skipping admin setup", admin);
        return Ok(());
    }

    let password = password_or_prompt(None, &format!("Password for '{}': ", admin))?;
    let confirm = password_or_prompt(None, "Confirm password: ")?;
    if password != confirm {
        return Err("Passwords do not match".into());
    }

    medgate
        .auth
        .create_user(&operator(), admin, &password, ROLE_ADMIN, &RequestContext::new())
        .await?;
    info!(username = %admin, "Administrator created");
    println!("Administrator '{}' created", admin);

    Ok(())
}

async fn user_command(config: &Config, command: UserCommands) -> CliResult {
    let medgate = Medgate::open(config).await?;
    let ctx = RequestContext::new();

    match command {
        UserCommands::Add {
            username,
            role,
            password,
        } => {
            let password = password_or_prompt(password, "Password: ")?;
            let user = medgate
                .auth
                .create_user(&operator(), &username, &password, &role, &ctx)
                .await?;
            println!(
                "Created user '{}' (id {}) with role {}",
                user.username, user.user_id, user.role_name
            );
        }
        UserCommands::List { format } => {
            let users = medgate.auth.list_users().await?;
            if format == "json" {
                return print_json(&users);
            }
            if users.is_empty() {
                println!("No users found");
                return Ok(());
            }

            println!("{:<6} {:<24} {:<16} {}", "ID", "USERNAME", "ROLE", "STATUS");
            println!("{}", "-".repeat(60));
            for user in users {
                let status = if user.is_active { "active" } else { "inactive" };
                println!(
                    "{:<6} {:<24} {:<16} {}",
                    user.user_id, user.username, user.role_name, status
                );
            }
        }
        UserCommands::SetRole { username, role } => {
            let user = medgate
                .storage
                .get_user_by_username(&username)
                .await?
                .ok_or_else(|| format!("User '{}' not found", username))?;
            medgate
                .auth
                .assign_role(&operator(), user.user_id, &role, &ctx)
                .await?;
            println!("User '{}' now has role {}", username, role);
        }
        UserCommands::Deactivate { username } => {
            let user = medgate
                .storage
                .get_user_by_username(&username)
                .await?
                .ok_or_else(|| format!("User '{}' not found", username))?;
            medgate
                .auth
                .deactivate_user(&operator(), user.user_id, &ctx)
                .await?;
            println!("User '{}' deactivated", username);
        }
    }

    Ok(())
}

async fn role_command(config: &Config, command: RoleCommands) -> CliResult {
    let medgate = Medgate::open(config).await?;
    let ctx = RequestContext::new();

    match command {
        RoleCommands::Add { name, description } => {
            let role = medgate
                .auth
                .create_role(&operator(), &name, description.as_deref(), &ctx)
                .await?;
            println!("Created role '{}' (id {})", role.role_name, role.role_id);
        }
        RoleCommands::List { format } => {
            let roles = medgate.auth.list_roles().await?;
            if format == "json" {
                return print_json(&roles);
            }

            println!("{:<6} {:<20} {:<6} {}", "ID", "NAME", "USERS", "DESCRIPTION");
            println!("{}", "-".repeat(80));
            for role in roles {
                println!(
                    "{:<6} {:<20} {:<6} {}",
                    role.role_id,
                    role.role_name,
                    role.user_count,
                    role.description.unwrap_or_default()
                );
            }
        }
        RoleCommands::Delete { name } => {
            medgate.auth.delete_role(&operator(), &name, &ctx).await?;
            println!("Role '{}' deleted", name);
        }
    }

    Ok(())
}

async fn permission_command(config: &Config, command: PermissionCommands) -> CliResult {
    let medgate = Medgate::open(config).await?;
    let ctx = RequestContext::new();

    match command {
        PermissionCommands::Matrix { format } => {
            let matrix = medgate.permissions.matrix().await?;
            if format == "json" {
                return print_json(&matrix);
            }

            for role in &matrix.roles {
                println!("{}", role);
                for resource in &matrix.resources {
                    let actions = matrix
                        .permissions
                        .get(role)
                        .and_then(|m| m.get(&resource.name))
                        .map(|a| a.join(", "))
                        .unwrap_or_default();
                    let actions = if actions.is_empty() { "-".to_string() } else { actions };
                    println!("  {:<18} {}", resource.name, actions);
                }
            }
        }
        PermissionCommands::List { role } => {
            for p in medgate.permissions.permissions_for_role(&role).await? {
                println!("{:<18} {}", p.resource_name, p.action_name);
            }
        }
        PermissionCommands::Grant {
            role,
            resource,
            action,
        } => {
            let added = medgate
                .permissions
                .grant(&operator(), &role, &resource, &action, &ctx)
                .await?;
            if added {
                println!("Granted {} on {} to {}", action, resource, role);
            } else {
                println!("{} already holds {} on {}", role, action, resource);
            }
        }
        PermissionCommands::Revoke {
            role,
            resource,
            action,
        } => {
            medgate
                .permissions
                .revoke(&operator(), &role, &resource, &action, &ctx)
                .await?;
            println!("Revoked {} on {} from {}", action, resource, role);
        }
    }

    Ok(())
}

async fn audit_command(config: &Config, command: AuditCommands) -> CliResult {
    let medgate = Medgate::open(config).await?;

    match command {
        AuditCommands::Logs {
            event_type,
            search,
            range,
            status,
            limit,
            offset,
        } => {
            let mut filter = AuditFilter::new().date_range(range.parse::<DateRange>()?);
            if let Some(event_type) = event_type {
                filter = filter.event_type(event_type.parse::<EventType>()?);
            }
            if let Some(search) = search {
                filter = filter.search(search);
            }
            if let Some(status) = status {
                filter = filter.status(status.parse::<AuditStatus>()?);
            }

            let page = medgate
                .audit
                .query(&filter, PageRequest { offset, limit })
                .await?;
            print_json(&page)?;
        }
        AuditCommands::FailedLogins { limit } => {
            print_json(&medgate.audit.failed_logins(limit).await?)?;
        }
        AuditCommands::Alerts => {
            print_json(&medgate.audit.detect_anomalies().await?)?;
        }
        AuditCommands::Stats { range } => {
            let stats = medgate.audit.aggregate(range.parse::<DateRange>()?).await?;
            print_json(&stats)?;
        }
    }

    Ok(())
}
