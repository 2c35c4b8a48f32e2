//! Bugledger CLI - lifecycle tracking for fuzzer-found bugs.

use bugledger::action_log;
use bugledger::cli::{
    BugCommands, Cli, CloseStatus, Commands, CrashCommands, DiscussionCommands, JobCommands,
    ManagerCommands, ReportCommands,
};
use bugledger::commands::{self, Output, Session};
use bugledger::config::{self, Config, OutputFormat};
use bugledger::models::BugStatus;
use bugledger::stats::Heartbeat;
use bugledger::storage;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let data_dir = match storage::resolve_data_dir(cli.data_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => fail(&e, cli.human_readable),
    };
    let config_path = config::config_path(cli.config.as_deref(), &data_dir);
    let config = config::load(&config_path);

    // CLI flag > config.kdl > JSON
    let human = cli.human_readable
        || matches!(
            &config,
            Ok(Config {
                output_format: Some(OutputFormat::Human),
                ..
            })
        );
    let log_config = config
        .as_ref()
        .map(|c| c.action_log.clone())
        .unwrap_or_default();

    let (cmd_name, args_json) = serialize_command(&cli.command);
    let start = Instant::now();

    let result = run_command(cli.command, &data_dir, &config_path, config, human);

    let duration = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    let (success, error) = match &result {
        Ok(_) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };
    action_log::log_action(&log_config, &data_dir, &cmd_name, args_json, success, error, duration);

    if let Err(e) = result {
        fail(&e, human);
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn fail(error: &bugledger::Error, human: bool) -> ! {
    if human {
        eprintln!("Error: {}", error);
    } else {
        eprintln!("{}", serde_json::json!({ "error": error.to_string() }));
    }
    process::exit(1);
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}

fn run_command(
    command: Commands,
    data_dir: &Path,
    config_path: &Path,
    config: bugledger::Result<Config>,
    human: bool,
) -> Result<(), bugledger::Error> {
    let open = move || Session::open(data_dir, config?);
    match command {
        Commands::Init => output(&commands::init(data_dir, config_path)?, human),
        Commands::Crash { command } => run_crash(&mut open()?, command, human)?,
        Commands::Bug { command } => run_bug(&mut open()?, command, human)?,
        Commands::Report { command } => run_report(&mut open()?, command, human)?,
        Commands::Job { command } => run_job(&mut open()?, command, human)?,
        Commands::Manager { command } => run_manager(&mut open()?, command, human)?,
        Commands::Discussion { command } => run_discussion(&mut open()?, command, human)?,
    }
    Ok(())
}

fn run_crash(session: &mut Session, command: CrashCommands, human: bool) -> Result<(), bugledger::Error> {
    match command {
        CrashCommands::Report {
            namespace,
            manager,
            title,
            alt_titles,
            build_id,
            log,
            report,
            repro_syz,
            repro_c,
            repro_opts,
            machine_info,
            guilty_files,
            maintainers,
            priority,
        } => {
            let args = commands::CrashReportArgs {
                namespace,
                manager,
                title,
                alt_titles,
                build_id,
                log,
                report,
                repro_syz,
                repro_c,
                repro_opts,
                machine_info,
                guilty_files,
                maintainers,
                priority,
            };
            output(&commands::crash_report(session, args)?, human);
        }
        CrashCommands::List { bug } => {
            output(&commands::crash_list(session, &bug)?, human);
        }
    }
    Ok(())
}

fn run_bug(session: &mut Session, command: BugCommands, human: bool) -> Result<(), bugledger::Error> {
    match command {
        BugCommands::Show { bug, canonical } => {
            output(&commands::bug_show(session, &bug, canonical)?, human);
        }
        BugCommands::Title { namespace, title } => {
            output(&commands::bug_by_title(session, &namespace, &title)?, human);
        }
        BugCommands::Stage { id } => {
            output(&commands::bug_by_stage(session, &id)?, human);
        }
        BugCommands::Dup { bug, dup_of } => {
            output(&commands::bug_dup(session, &bug, &dup_of)?, human);
        }
        BugCommands::Status {
            bug,
            status,
            reason,
        } => {
            let status = match status {
                CloseStatus::Fixed => BugStatus::Fixed,
                CloseStatus::Invalid => BugStatus::Invalid,
            };
            output(&commands::bug_set_status(session, &bug, status, reason)?, human);
        }
        BugCommands::Reopen { bug } => {
            output(&commands::bug_reopen(session, &bug)?, human);
        }
        BugCommands::Similar { bug } => {
            output(&commands::bug_similar(session, &bug)?, human);
        }
        BugCommands::Commits { bug, commits } => {
            output(&commands::bug_commits(session, &bug, commits)?, human);
        }
        BugCommands::Label {
            bug,
            label,
            value,
            by,
            link,
        } => {
            output(&commands::bug_label(session, &bug, &label, &value, &by, link)?, human);
        }
    }
    Ok(())
}

fn run_report(session: &mut Session, command: ReportCommands, human: bool) -> Result<(), bugledger::Error> {
    match command {
        ReportCommands::Send { bug, crash, outbox } => {
            output(&commands::report_send(session, &bug, crash, outbox)?, human);
        }
        ReportCommands::Hold { bug } => {
            output(&commands::report_hold(session, &bug)?, human);
        }
        ReportCommands::Release { bug } => {
            output(&commands::report_release(session, &bug)?, human);
        }
        ReportCommands::Upstream { bug } => {
            output(&commands::report_upstream(session, &bug)?, human);
        }
        ReportCommands::Label { bug, stage, label } => {
            output(&commands::report_label(session, &bug, &stage, &label)?, human);
        }
    }
    Ok(())
}

fn run_job(session: &mut Session, command: JobCommands, human: bool) -> Result<(), bugledger::Error> {
    match command {
        JobCommands::Create {
            bug,
            kind,
            user,
            repo,
            branch,
            crash,
            merge_base_repo,
            merge_base_branch,
            bisect_from,
            patch,
            kernel_config,
            tree_origin,
        } => {
            let args = commands::JobCreateArgs {
                bug,
                kind,
                user,
                repo,
                branch,
                crash,
                merge_base_repo,
                merge_base_branch,
                bisect_from,
                patch,
                kernel_config,
                tree_origin,
            };
            output(&commands::job_create(session, args)?, human);
        }
        JobCommands::Start { job } => {
            output(&commands::job_start(session, &job)?, human);
        }
        JobCommands::Finish {
            job,
            crash_title,
            commits,
            flags,
            log,
            error,
        } => {
            let result = commands::job_finish(session, &job, crash_title, commits, flags, log, error)?;
            output(&result, human);
        }
        JobCommands::Reported { job } => {
            output(&commands::job_reported(session, &job)?, human);
        }
        JobCommands::Invalidate { job, user } => {
            output(&commands::job_invalidate(session, &job, &user)?, human);
        }
        JobCommands::List { bug } => {
            output(&commands::job_list(session, &bug)?, human);
        }
        JobCommands::Dispatch { spool, stale_hours } => {
            output(&commands::job_dispatch(session, spool, stale_hours)?, human);
        }
        JobCommands::Stale { hours } => {
            output(&commands::job_stale(session, hours)?, human);
        }
    }
    Ok(())
}

fn run_manager(session: &mut Session, command: ManagerCommands, human: bool) -> Result<(), bugledger::Error> {
    match command {
        ManagerCommands::Heartbeat {
            namespace,
            name,
            link,
            build,
            up_time,
            fuzzing_time,
            corpus,
            pcs,
            cover,
            crashes,
            crash_types,
            suppressed_crashes,
            execs,
        } => {
            let beat = Heartbeat {
                link,
                build,
                up_time_secs: up_time,
                fuzzing_time_secs: fuzzing_time,
                corpus,
                pcs,
                cover,
                crashes,
                crash_types,
                suppressed_crashes,
                execs,
            };
            output(&commands::manager_heartbeat(session, &namespace, &name, &beat)?, human);
        }
        ManagerCommands::Show { namespace, name } => {
            output(&commands::manager_show(session, &namespace, &name)?, human);
        }
        ManagerCommands::List { namespace } => {
            output(&commands::manager_list(session, &namespace)?, human);
        }
    }
    Ok(())
}

fn run_discussion(session: &mut Session, command: DiscussionCommands, human: bool) -> Result<(), bugledger::Error> {
    match command {
        DiscussionCommands::Record {
            source,
            id,
            kind,
            subject,
            bugs,
            messages,
        } => {
            let args = commands::DiscussionArgs {
                source,
                id,
                kind,
                subject,
                bugs,
                messages,
            };
            output(&commands::discussion_record(session, args)?, human);
        }
    }
    Ok(())
}

fn path_arg(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.display().to_string())
}

/// Command name and arguments as recorded in the action log.
fn serialize_command(command: &Commands) -> (String, serde_json::Value) {
    match command {
        Commands::Init => ("init".to_string(), serde_json::json!({})),

        Commands::Crash { command } => match command {
            CrashCommands::Report {
                namespace,
                manager,
                title,
                alt_titles,
                build_id,
                log,
                report,
                repro_syz,
                repro_c,
                priority,
                ..
            } => (
                "crash report".to_string(),
                serde_json::json!({
                    "namespace": namespace,
                    "manager": manager,
                    "title": title,
                    "alt_titles": alt_titles,
                    "build_id": build_id,
                    "log": path_arg(log),
                    "report": path_arg(report),
                    "repro_syz": path_arg(repro_syz),
                    "repro_c": path_arg(repro_c),
                    "priority": priority,
                }),
            ),
            CrashCommands::List { bug } => {
                ("crash list".to_string(), serde_json::json!({ "bug": bug }))
            }
        },

        Commands::Bug { command } => match command {
            BugCommands::Show { bug, canonical } => (
                "bug show".to_string(),
                serde_json::json!({ "bug": bug, "canonical": canonical }),
            ),
            BugCommands::Title { namespace, title } => (
                "bug title".to_string(),
                serde_json::json!({ "namespace": namespace, "title": title }),
            ),
            BugCommands::Stage { id } => ("bug stage".to_string(), serde_json::json!({ "id": id })),
            BugCommands::Dup { bug, dup_of } => (
                "bug dup".to_string(),
                serde_json::json!({ "bug": bug, "dup_of": dup_of }),
            ),
            BugCommands::Status {
                bug,
                status,
                reason,
            } => (
                "bug status".to_string(),
                serde_json::json!({ "bug": bug, "status": format!("{:?}", status).to_lowercase(), "reason": reason }),
            ),
            BugCommands::Reopen { bug } => {
                ("bug reopen".to_string(), serde_json::json!({ "bug": bug }))
            }
            BugCommands::Similar { bug } => {
                ("bug similar".to_string(), serde_json::json!({ "bug": bug }))
            }
            BugCommands::Commits { bug, commits } => (
                "bug commits".to_string(),
                serde_json::json!({ "bug": bug, "commits": commits }),
            ),
            BugCommands::Label {
                bug,
                label,
                value,
                by,
                link,
            } => (
                "bug label".to_string(),
                serde_json::json!({ "bug": bug, "label": label, "value": value, "by": by, "link": link }),
            ),
        },

        Commands::Report { command } => match command {
            ReportCommands::Send { bug, crash, outbox } => (
                "report send".to_string(),
                serde_json::json!({ "bug": bug, "crash": crash, "outbox": path_arg(outbox) }),
            ),
            ReportCommands::Hold { bug } => {
                ("report hold".to_string(), serde_json::json!({ "bug": bug }))
            }
            ReportCommands::Release { bug } => {
                ("report release".to_string(), serde_json::json!({ "bug": bug }))
            }
            ReportCommands::Upstream { bug } => {
                ("report upstream".to_string(), serde_json::json!({ "bug": bug }))
            }
            ReportCommands::Label { bug, stage, label } => (
                "report label".to_string(),
                serde_json::json!({ "bug": bug, "stage": stage, "label": label }),
            ),
        },

        Commands::Job { command } => match command {
            JobCommands::Create {
                bug,
                kind,
                user,
                repo,
                branch,
                crash,
                bisect_from,
                patch,
                tree_origin,
                ..
            } => (
                "job create".to_string(),
                serde_json::json!({
                    "bug": bug,
                    "kind": kind,
                    "user": user,
                    "repo": repo,
                    "branch": branch,
                    "crash": crash,
                    "bisect_from": bisect_from,
                    "patch": path_arg(patch),
                    "tree_origin": tree_origin,
                }),
            ),
            JobCommands::Start { job } => ("job start".to_string(), serde_json::json!({ "job": job })),
            JobCommands::Finish {
                job,
                crash_title,
                commits,
                flags,
                error,
                ..
            } => (
                "job finish".to_string(),
                serde_json::json!({
                    "job": job,
                    "crash_title": crash_title,
                    "commits": commits,
                    "flags": flags,
                    "error": path_arg(error),
                }),
            ),
            JobCommands::Reported { job } => {
                ("job reported".to_string(), serde_json::json!({ "job": job }))
            }
            JobCommands::Invalidate { job, user } => (
                "job invalidate".to_string(),
                serde_json::json!({ "job": job, "user": user }),
            ),
            JobCommands::List { bug } => ("job list".to_string(), serde_json::json!({ "bug": bug })),
            JobCommands::Dispatch { spool, stale_hours } => (
                "job dispatch".to_string(),
                serde_json::json!({ "spool": path_arg(spool), "stale_hours": stale_hours }),
            ),
            JobCommands::Stale { hours } => {
                ("job stale".to_string(), serde_json::json!({ "hours": hours }))
            }
        },

        Commands::Manager { command } => match command {
            ManagerCommands::Heartbeat {
                namespace,
                name,
                build,
                crashes,
                execs,
                ..
            } => (
                "manager heartbeat".to_string(),
                serde_json::json!({
                    "namespace": namespace,
                    "name": name,
                    "build": build,
                    "crashes": crashes,
                    "execs": execs,
                }),
            ),
            ManagerCommands::Show { namespace, name } => (
                "manager show".to_string(),
                serde_json::json!({ "namespace": namespace, "name": name }),
            ),
            ManagerCommands::List { namespace } => (
                "manager list".to_string(),
                serde_json::json!({ "namespace": namespace }),
            ),
        },

        Commands::Discussion { command } => match command {
            DiscussionCommands::Record {
                source,
                id,
                bugs,
                messages,
                ..
            } => (
                "discussion record".to_string(),
                serde_json::json!({
                    "source": source,
                    "id": id,
                    "bugs": bugs,
                    "messages": path_arg(messages),
                }),
            ),
        },
    }
}
