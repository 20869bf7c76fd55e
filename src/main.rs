#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate libc;
extern crate loggerv;

extern crate armada;

use std::env;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::process;
use std::sync::Arc;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use armada::agent::{Agent, HttpAgent, MockAgent};
use armada::assemble;
use armada::clock::SystemClock;
use armada::cpi::MockCloud;
use armada::deploy::{Deployer, NullCompiler};
use armada::eventlog::render::{LineSink, Renderer};
use armada::eventlog::EventLog;
use armada::lock::LockManager;
use armada::plan::{Plan, PlanOptions, StateOverride};
use armada::update::Canceller;
use armada::*;

fn print_error_debug(e: &Error) {
    // print causes of error if present
    for cause in e.iter().skip(1) {
        warn!("caused by: {}", cause);
    }
}

fn main() {
    let app = App::new("armada")
        .version(crate_version!())
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::DeriveDisplayOrder)
        .global_settings(&[AppSettings::ColoredHelp])
        .about("Drive VM fleets to their declared state")
        .arg(Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .help("Increase verbosity"))
        .arg(Arg::with_name("debug")
            .short("d")
            .long("debug")
            .help("Adds line numbers to log statements"))

        .subcommand(SubCommand::with_name("deploy")
            .about("Apply a deployment manifest")
            .arg(Arg::with_name("manifest")
                .required(true)
                .help("Path to the deployment manifest"))
            .arg(Arg::with_name("recreate")
                .long("recreate")
                .help("Force VM replacement for every instance"))
            .arg(Arg::with_name("job-state")
                .long("job-state")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Per instance override, e.g. web/0=stopped")))

        .subcommand(SubCommand::with_name("validate")
            .about("Parse and verify a manifest without applying it")
            .arg(Arg::with_name("manifest")
                .required(true)
                .help("Path to the deployment manifest")))

        .subcommand(SubCommand::with_name("plan")
            .about("Show the per-instance transition classification")
            .arg(Arg::with_name("manifest")
                .required(true)
                .help("Path to the deployment manifest")))

        .subcommand(SubCommand::with_name("render")
            .about("Re-render a recorded event stream")
            .arg(Arg::with_name("eventlog")
                .required(true)
                .help("Path to a line-delimited event log")));

    // arg parse
    let args = app.get_matches();
    let name = args.subcommand_name().unwrap();
    let _ = run(&args).map_err(|e| {
        error!("{} error: {}", name, e);
        print_error_debug(&e);
        process::exit(exit_code(&e));
    });
    process::exit(0);
}

fn run(args: &ArgMatches) -> Result<()> {
    // always show INFO messages (+1); LOG_LEVEL can push further
    let env_verbosity = match env::var("LOG_LEVEL").ok().as_ref().map(|s| s.as_str()) {
        Some("error") => 0,
        Some("warn") => 0,
        Some("debug") => 2,
        Some("trace") => 3,
        _ => 1,
    };
    loggerv::Logger::new()
        .verbosity(args.occurrences_of("verbose") + env_verbosity)
        .module_path(true)
        .line_numbers(args.is_present("debug"))
        .init()
        .unwrap();
    armada::init()?;

    // Ignore SIGPIPE errors to avoid having to use let _ = write! everywhere
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let conf = Config::read()?;
    conf.verify()?;

    dispatch_commands(args, &conf)
}

fn read_manifest(args: &ArgMatches) -> Result<String> {
    use std::io::Read;
    let path = args.value_of("manifest").unwrap();
    let mut text = String::new();
    File::open(path)
        .chain_err(|| format!("cannot open manifest {}", path))?
        .read_to_string(&mut text)?;
    Ok(text)
}

fn parse_opts(args: &ArgMatches) -> Result<PlanOptions> {
    let mut opts = PlanOptions::default();
    opts.recreate = args.is_present("recreate");
    if let Some(states) = args.values_of("job-state") {
        for s in states {
            opts.overrides.push(parse_job_state(s)?);
        }
    }
    Ok(opts)
}

// web/0=stopped or web=detached
fn parse_job_state(s: &str) -> Result<(String, Option<u32>, StateOverride)> {
    let mut kv = s.splitn(2, '=');
    let lhs = kv.next().unwrap();
    let state = match kv.next() {
        Some(st) => StateOverride::parse(st, "job-state")?,
        None => {
            return Err(ErrorKind::InvalidValue(
                "job-state".into(),
                format!("'{}' is not of the form job[/index]=state", s),
            ).into())
        }
    };
    match lhs.find('/') {
        Some(pos) => {
            let index: u32 = lhs[pos + 1..].parse().map_err(|_| {
                ErrorKind::InvalidValue("job-state".into(), format!("bad index in '{}'", s))
            })?;
            Ok((lhs[..pos].to_string(), Some(index), state))
        }
        None => Ok((lhs.to_string(), None, state)),
    }
}

fn make_deployer(conf: &Config) -> Result<Deployer> {
    let clock = Arc::new(SystemClock);
    let renderer = Arc::new(Renderer::new(
        Box::new(io::stdout()),
        conf.no_progress_stages.clone(),
    ));
    let tee: Option<Box<dyn Write + Send>> = match conf.event_sink {
        Some(ref pth) => Some(Box::new(File::create(pth)?)),
        None => None,
    };
    let sink = LineSink::new(renderer, tee);
    let log = EventLog::new(Box::new(sink), clock.clone(), conf.event_buffer);
    let agent: Arc<dyn Agent> = match conf.agent_api {
        Some(ref url) => Arc::new(HttpAgent::new(url)?),
        None => Arc::new(MockAgent::new()),
    };
    Ok(Deployer {
        config: conf.clone(),
        store: Store::new(),
        cloud: Arc::new(MockCloud::new()),
        agent,
        compiler: Arc::new(NullCompiler),
        locks: LockManager::new(),
        clock,
        log,
        cancel: Canceller::new(),
    })
}

/// Dispatch clap arguments to armada handlers
fn dispatch_commands(args: &ArgMatches, conf: &Config) -> Result<()> {
    if let Some(a) = args.subcommand_matches("deploy") {
        let text = read_manifest(a)?;
        let opts = parse_opts(a)?;
        let deployer = make_deployer(conf)?;
        let res = deployer.apply(&text, &opts);
        deployer.log.close();
        return res;
    }

    if let Some(a) = args.subcommand_matches("validate") {
        let text = read_manifest(a)?;
        let plan = Plan::parse(&text, &PlanOptions::default())?;
        println!("{} is valid ({} jobs, {} instances)", plan.name, plan.jobs.len(), plan.instances.len());
        return Ok(());
    }

    if let Some(a) = args.subcommand_matches("plan") {
        let text = read_manifest(a)?;
        let opts = parse_opts(a)?;
        let mut plan = Plan::parse(&text, &opts)?;
        // classify against an empty store; everything not yet deployed
        // in this process shows as a create
        let deployer = make_deployer(conf)?;
        let prepared = assemble::prepare(&mut plan, &deployer.store, &deployer.log)?;
        deployer.log.close();
        for inst in &plan.instances {
            println!("{}\t{}\t{}", inst.id(), inst.action, inst.target);
        }
        for rec in &prepared.obsolete {
            println!("{}/{}\tdelete\t-", rec.job, rec.index);
        }
        return Ok(());
    }

    if let Some(a) = args.subcommand_matches("render") {
        let path = a.value_of("eventlog").unwrap();
        let f = File::open(path).chain_err(|| format!("cannot open event log {}", path))?;
        let renderer = Renderer::new(Box::new(io::stdout()), conf.no_progress_stages.clone());
        renderer.consume(BufReader::new(f))?;
        if renderer.dropped() > 0 {
            warn!("dropped {} invalid event lines", renderer.dropped());
        }
        return Ok(());
    }

    unreachable!("SubcommandRequiredElseHelp prevents this")
}
