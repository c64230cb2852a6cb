//! REPL – the interactive `taskgate` shell.
//!
//! Supported slash-commands:
//!   /help                                               – show this list
//!   /create <client> <type> <priority> [json]           – create a task
//!   /tasks <client> [status]                            – list tasks
//!   /receipts <client> [limit]                          – newest receipts
//!   /approve <client> <task_id> <actor> [reason]        – approve a gated task
//!   /cancel <client> <task_id> <actor> [reason]         – cancel a task
//!   /policy <client> <type> <decision> <actor>          – set a policy rule
//!   /policies <client>                                  – list policy rules
//!   /run                                                – one dispatch pass
//!   /verify <client> [limit]                            – verify a receipt chain
//!   /health                                             – chains and queue report
//!   /workers                                            – registered task types
//!   /start | /stop                                      – background dispatcher pool
//!   /quit | /exit                                       – stop the pool and exit

use colored::Colorize;
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use taskgate_kernel::Kernel;
use taskgate_types::{
    Actor, Decision, DispatchOutcome, NewTask, ReceiptFilter, TaskFilter, TaskOutcome, TaskStatus,
    format_timestamp,
};
use uuid::Uuid;

use crate::config::Config;
use crate::pool::{self, DispatcherPool};

/// A parsed slash-command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Create {
        client_id: String,
        task_type: String,
        priority: u8,
        payload: Value,
    },
    Tasks {
        client_id: String,
        status: Option<TaskStatus>,
    },
    Receipts {
        client_id: String,
        limit: Option<usize>,
    },
    Approve {
        client_id: String,
        task_id: Uuid,
        actor: Actor,
        reason: Option<String>,
    },
    Cancel {
        client_id: String,
        task_id: Uuid,
        actor: Actor,
        reason: Option<String>,
    },
    Policy {
        client_id: String,
        task_type: String,
        decision: Decision,
        actor: Actor,
    },
    Policies {
        client_id: String,
    },
    Run,
    Verify {
        client_id: String,
        limit: Option<usize>,
    },
    Health,
    Workers,
    Start,
    Stop,
    Quit,
}

/// Parse one input line.  The last argument of `/create`, `/approve` and
/// `/cancel` takes the rest of the line, so JSON and reasons may contain
/// spaces.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match name {
        "/help" => Ok(Command::Help),
        "/create" => {
            let [client_id, task_type, priority, payload] =
                split_args(rest, 3, "/create <client> <type> <priority> [json]")?;
            let priority = priority
                .parse::<u8>()
                .map_err(|_| format!("priority '{priority}' is not a number"))?;
            let payload = match payload {
                "" => Value::Object(Default::default()),
                raw => serde_json::from_str(raw).map_err(|e| format!("payload is not JSON: {e}"))?,
            };
            Ok(Command::Create {
                client_id: client_id.to_string(),
                task_type: task_type.to_string(),
                priority,
                payload,
            })
        }
        "/tasks" => {
            let [client_id, status] = split_args(rest, 1, "/tasks <client> [status]")?;
            let status = match status {
                "" => None,
                raw => Some(raw.parse::<TaskStatus>().map_err(|e| e.to_string())?),
            };
            Ok(Command::Tasks {
                client_id: client_id.to_string(),
                status,
            })
        }
        "/receipts" => {
            let [client_id, limit] = split_args(rest, 1, "/receipts <client> [limit]")?;
            Ok(Command::Receipts {
                client_id: client_id.to_string(),
                limit: parse_limit(limit)?,
            })
        }
        "/approve" | "/cancel" => {
            let usage = format!("{name} <client> <task_id> <actor> [reason]");
            let [client_id, task_id, actor, reason] = split_args(rest, 3, &usage)?;
            let task_id = Uuid::parse_str(task_id)
                .map_err(|_| format!("'{task_id}' is not a task id"))?;
            let actor = actor.parse::<Actor>().map_err(|e| e.to_string())?;
            let client_id = client_id.to_string();
            let reason = (!reason.is_empty()).then(|| reason.to_string());
            Ok(if name == "/approve" {
                Command::Approve {
                    client_id,
                    task_id,
                    actor,
                    reason,
                }
            } else {
                Command::Cancel {
                    client_id,
                    task_id,
                    actor,
                    reason,
                }
            })
        }
        "/policy" => {
            let [client_id, task_type, decision, actor] = split_args(
                rest,
                4,
                "/policy <client> <type> <allow|require_approval|deny> <actor>",
            )?;
            Ok(Command::Policy {
                client_id: client_id.to_string(),
                task_type: task_type.to_string(),
                decision: decision.parse::<Decision>().map_err(|e| e.to_string())?,
                actor: actor.parse::<Actor>().map_err(|e| e.to_string())?,
            })
        }
        "/policies" => {
            let [client_id] = split_args(rest, 1, "/policies <client>")?;
            Ok(Command::Policies {
                client_id: client_id.to_string(),
            })
        }
        "/run" => Ok(Command::Run),
        "/verify" => {
            let [client_id, limit] = split_args(rest, 1, "/verify <client> [limit]")?;
            Ok(Command::Verify {
                client_id: client_id.to_string(),
                limit: parse_limit(limit)?,
            })
        }
        "/health" => Ok(Command::Health),
        "/workers" => Ok(Command::Workers),
        "/start" => Ok(Command::Start),
        "/stop" => Ok(Command::Stop),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

/// Split `rest` into `N` arguments, the first `required` of which must be
/// present.  The final argument swallows the remainder of the line; missing
/// optional arguments are empty strings.
fn split_args<'a, const N: usize>(
    rest: &'a str,
    required: usize,
    usage: &str,
) -> Result<[&'a str; N], String> {
    let mut args = [""; N];
    let mut remaining = rest.trim();
    for (i, slot) in args.iter_mut().enumerate() {
        if remaining.is_empty() {
            break;
        }
        if i + 1 == N {
            *slot = remaining;
            break;
        }
        let (arg, tail) = remaining
            .split_once(char::is_whitespace)
            .unwrap_or((remaining, ""));
        *slot = arg;
        remaining = tail.trim_start();
    }
    if args[..required].iter().any(|arg| arg.is_empty()) {
        return Err(format!("usage: {usage}"));
    }
    Ok(args)
}

fn parse_limit(raw: &str) -> Result<Option<usize>, String> {
    match raw {
        "" => Ok(None),
        raw => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|_| format!("limit '{raw}' is not a number")),
    }
}

/// State shared by the command handlers.
pub struct Session {
    kernel: Arc<Kernel>,
    config: Config,
    pool: Option<DispatcherPool>,
}

impl Session {
    pub fn new(kernel: Arc<Kernel>, config: Config) -> Self {
        Self {
            kernel,
            config,
            pool: None,
        }
    }

    /// Execute one command.  Returns `false` when the shell should exit.
    pub fn execute(&mut self, command: Command) -> Result<bool, String> {
        match command {
            Command::Help => cmd_help(),
            Command::Create {
                client_id,
                task_type,
                priority,
                payload,
            } => self.cmd_create(NewTask::new(client_id, task_type, payload, priority))?,
            Command::Tasks { client_id, status } => self.cmd_tasks(&client_id, status)?,
            Command::Receipts { client_id, limit } => self.cmd_receipts(&client_id, limit)?,
            Command::Approve {
                client_id,
                task_id,
                actor,
                reason,
            } => {
                let task = self
                    .kernel
                    .approve_task(task_id, &client_id, &actor, reason.as_deref())
                    .map_err(|e| e.to_string())?;
                println!(
                    "{} {} is {}",
                    "✓".green().bold(),
                    task.task_id,
                    task.status.to_string().green()
                );
            }
            Command::Cancel {
                client_id,
                task_id,
                actor,
                reason,
            } => {
                let task = self
                    .kernel
                    .cancel_task(task_id, &client_id, &actor, reason.as_deref())
                    .map_err(|e| e.to_string())?;
                println!(
                    "{} {} is {}",
                    "✓".green().bold(),
                    task.task_id,
                    task.status.to_string().yellow()
                );
            }
            Command::Policy {
                client_id,
                task_type,
                decision,
                actor,
            } => {
                let policy = self
                    .kernel
                    .set_policy(&client_id, &task_type, decision, &actor)
                    .map_err(|e| e.to_string())?;
                println!(
                    "{} {} / {} → {}",
                    "✓".green().bold(),
                    policy.client_id.bold(),
                    policy.task_type,
                    policy.decision.to_string().cyan()
                );
            }
            Command::Policies { client_id } => self.cmd_policies(&client_id)?,
            Command::Run => self.cmd_run()?,
            Command::Verify { client_id, limit } => self.cmd_verify(&client_id, limit)?,
            Command::Health => self.cmd_health()?,
            Command::Workers => self.cmd_workers(),
            Command::Start => self.cmd_start()?,
            Command::Stop => self.cmd_stop(),
            Command::Quit => {
                self.cmd_stop();
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn cmd_create(&self, new: NewTask) -> Result<(), String> {
        let task = self.kernel.create_task(new).map_err(|e| e.to_string())?;
        let status = match task.status {
            TaskStatus::Pending => task.status.to_string().green(),
            TaskStatus::AwaitingApproval => task.status.to_string().yellow(),
            _ => task.status.to_string().red(),
        };
        println!("{} task {} ({})", "✓".green().bold(), task.task_id.to_string().bold(), status);
        Ok(())
    }

    fn cmd_tasks(&self, client_id: &str, status: Option<TaskStatus>) -> Result<(), String> {
        let mut filter = TaskFilter::default();
        if let Some(status) = status {
            filter = filter.with_status(status);
        }
        let tasks = self
            .kernel
            .get_tasks(client_id, &filter)
            .map_err(|e| e.to_string())?;
        if tasks.is_empty() {
            println!("  {}", "no tasks".dimmed());
            return Ok(());
        }
        for task in &tasks {
            println!(
                "  {}  {:<18} p{:<2} retries={} {}  {}",
                task.task_id,
                task.status.to_string(),
                task.priority,
                task.retry_count,
                task.task_type.bold(),
                format_timestamp(&task.created_at).dimmed()
            );
        }
        Ok(())
    }

    fn cmd_receipts(&self, client_id: &str, limit: Option<usize>) -> Result<(), String> {
        let mut filter = ReceiptFilter::default();
        if let Some(limit) = limit {
            filter = filter.with_limit(limit);
        }
        let receipts = self
            .kernel
            .get_receipts(client_id, &filter)
            .map_err(|e| e.to_string())?;
        if receipts.is_empty() {
            println!("  {}", "no receipts".dimmed());
        }
        for receipt in &receipts {
            let task = receipt
                .task_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {}  {:<18} {:<36} {}  {}",
                format_timestamp(&receipt.created_at).dimmed(),
                receipt.action.to_string().cyan(),
                task,
                receipt.actor,
                receipt.hash.get(..12).unwrap_or(&receipt.hash)
            );
        }
        Ok(())
    }

    fn cmd_policies(&self, client_id: &str) -> Result<(), String> {
        let policies = self
            .kernel
            .list_policies(client_id)
            .map_err(|e| e.to_string())?;
        if policies.is_empty() {
            println!("  {} every task type is allowed", "no rules –".dimmed());
        }
        for policy in &policies {
            println!(
                "  {:<24} {:<18} by {}",
                policy.task_type.bold(),
                policy.decision.to_string().cyan(),
                policy.updated_by
            );
        }
        Ok(())
    }

    fn cmd_run(&self) -> Result<(), String> {
        match self.kernel.run_next_task().map_err(|e| e.to_string())? {
            DispatchOutcome::Idle => println!("  {}", "nothing to run".dimmed()),
            DispatchOutcome::Resolved { task_id, outcome } => match outcome {
                TaskOutcome::Completed => {
                    println!("  {} {} completed", "✓".green().bold(), task_id)
                }
                TaskOutcome::Retrying { retry_count, error } => println!(
                    "  {} {} failed ({}), retry {} scheduled",
                    "↻".yellow(),
                    task_id,
                    error,
                    retry_count
                ),
                TaskOutcome::Failed { error } => {
                    println!("  {} {} failed: {}", "✗".red().bold(), task_id, error)
                }
            },
        }
        Ok(())
    }

    fn cmd_verify(&self, client_id: &str, limit: Option<usize>) -> Result<(), String> {
        let limit = limit.unwrap_or(self.config.verify_limit);
        let verification = self
            .kernel
            .verify_chain(client_id, limit)
            .map_err(|e| e.to_string())?;
        if verification.valid {
            println!(
                "  {} chain of {} intact ({} receipts checked)",
                "✓".green().bold(),
                client_id.bold(),
                verification.checked
            );
        } else {
            let at = verification
                .first_mismatch
                .map(|id| id.to_string())
                .unwrap_or_default();
            println!(
                "  {} chain of {} broken after {} receipts at {}",
                "✗".red().bold(),
                client_id.bold(),
                verification.checked,
                at.yellow()
            );
        }
        Ok(())
    }

    fn cmd_health(&self) -> Result<(), String> {
        let report = self
            .kernel
            .health_monitor(self.config.verify_limit, self.config.stale_claim_timeout())
            .check()
            .map_err(|e| e.to_string())?;
        let headline = if report.healthy {
            "healthy".green().bold()
        } else {
            "UNHEALTHY".red().bold()
        };
        println!("{}", "Health".bold().underline());
        println!("  status       : {}", headline);
        println!("  pending      : {}", report.pending);
        println!("  stale claims : {}", report.stale_claims);
        for chain in &report.chains {
            let mark = if chain.valid { "✓".green() } else { "✗".red() };
            println!("  {} {:<24} {} receipts", mark, chain.client_id, chain.checked);
        }
        Ok(())
    }

    fn cmd_workers(&self) {
        let registry = self.kernel.registry();
        println!("{}", "Workers".bold().underline());
        for task_type in registry.task_types() {
            let typed = if registry.payload_schema(task_type).is_some() {
                "typed payload".dimmed()
            } else {
                "any payload".dimmed()
            };
            let rule = self.kernel.dispatcher().retry_policy().rule_for(task_type);
            println!(
                "  {:<24} {}  attempts={}",
                task_type.bold().cyan(),
                typed,
                rule.max_attempts()
            );
        }
    }

    fn cmd_start(&mut self) -> Result<(), String> {
        if self.pool.is_some() {
            println!("  {}", "dispatcher pool already running".yellow());
            return Ok(());
        }
        let settings = self.config.pool_settings();
        let pool = DispatcherPool::start(self.kernel.clone(), settings)
            .map_err(|e| format!("failed to start dispatcher pool: {e}"))?;
        self.pool = Some(pool);
        println!(
            "  {} {} dispatcher(s) running. Type {} to stop.",
            "✓".green().bold(),
            settings.dispatchers,
            "/stop".bold()
        );
        Ok(())
    }

    fn cmd_stop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let resolved = pool.stop();
            println!("  {} pool stopped after resolving {} task(s)", "✓".green().bold(), resolved);
        }
    }

    /// One reaper and health pass, as the pool runs on its interval.
    pub fn maintenance(&self) {
        pool::run_maintenance(&self.kernel, &self.config.pool_settings());
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(kernel: Arc<Kernel>, config: Config, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut session = Session::new(kernel, config);
    session.maintenance();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            session.cmd_stop();
            break;
        }

        print!("{} ", "taskgate>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                session.cmd_stop();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                session.cmd_stop();
                break;
            }
        }

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }

        match parse_command(cmd).and_then(|command| session.execute(command)) {
            Ok(true) => {}
            Ok(false) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) if e.starts_with("unknown command") => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    cmd.yellow(),
                    "/help".bold()
                );
            }
            Err(e) => println!("{}: {}", "Error".red(), e),
        }
    }
}

fn cmd_help() {
    const COMMANDS: &[(&str, &str)] = &[
        ("/create <client> <type> <priority> [json]", "create a task"),
        ("/tasks <client> [status]", "list tasks"),
        ("/receipts <client> [limit]", "newest receipts first"),
        ("/approve <client> <id> <actor> [reason]", "approve an awaiting task"),
        ("/cancel <client> <id> <actor> [reason]", "cancel a task"),
        ("/policy <client> <type> <decision> <actor>", "set a rule"),
        ("/policies <client>", "list rules"),
        ("/run", "one dispatch pass"),
        ("/verify <client> [limit]", "verify a receipt chain"),
        ("/health", "chains and queue report"),
        ("/workers", "registered task types"),
        ("/start  /stop", "background dispatcher pool"),
        ("/quit  /exit", "exit the shell"),
    ];
    println!();
    println!("{}", "taskgate Commands".bold().underline());
    for (usage, about) in COMMANDS {
        println!("  {} – {}", format!("{usage:<42}").bold().cyan(), about);
    }
    println!();
    println!("  Actors are {} or {}.", "system".bold(), "user:<identifier>".bold());
    println!();
}
