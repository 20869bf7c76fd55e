use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::channel;
use std::sync::Arc;

use threadpool::ThreadPool;

use agent::Agent;
use assemble::{self, Prepared};
use clock::Clock;
use config::Config;
use cpi::Cloud;
use eventlog::EventLog;
use lock::LockManager;
use plan::{Plan, PlanOptions};
use store::{InstanceRecord, Store};
use update::{batch, instance, pools, Canceller, UpdateCtx};
use super::{Error, Result};

/// CLI-facing apply options
pub use plan::PlanOptions as DeployOpts;

/// External package compiler the deploy waits on
///
/// Compilation itself happens elsewhere; the orchestrator only cares that
/// every release compiled before instances pick up new specs.
pub trait Compiler: Send + Sync {
    fn compile(&self, release: &str, version: &str) -> Result<()>;
}

/// Compiler used when compilation is handled out of band
pub struct NullCompiler;

impl Compiler for NullCompiler {
    fn compile(&self, release: &str, version: &str) -> Result<()> {
        debug!("assuming {}/{} is compiled", release, version);
        Ok(())
    }
}

/// Drives one deployment manifest to its target state
pub struct Deployer {
    pub config: Config,
    pub store: Store,
    pub cloud: Arc<dyn Cloud>,
    pub agent: Arc<dyn Agent>,
    pub compiler: Arc<dyn Compiler>,
    pub locks: LockManager,
    pub clock: Arc<dyn Clock>,
    pub log: EventLog,
    pub cancel: Canceller,
}

impl Deployer {
    /// Token external callers use to request a graceful halt
    pub fn canceller(&self) -> Canceller {
        self.cancel.clone()
    }

    /// Apply a manifest: plan, prepare, reconcile pools, update jobs, commit
    ///
    /// Validation happens before the lock and before any mutation. The
    /// working manifest copy, stemcell reference reconciliation and lock
    /// release are finalizers and run on every exit path.
    pub fn apply(&self, manifest_text: &str, opts: &PlanOptions) -> Result<()> {
        let mut plan = Plan::parse(manifest_text, opts)?;
        let _lock = self.locks.deployment(&plan.name)?;
        info!("deploying {}", plan.name);

        let workfile = format!("{}.deploy.gen.yml", plan.name);
        self.write_workfile(&workfile, manifest_text)?;

        let res = self.run(&mut plan);

        // ensure: temp file gone, stemcell join rows reconciled; the
        // deployment lock releases on drop
        let _ = fs::remove_file(&workfile);
        if let Err(e) = self
            .store
            .update_stemcell_references(&plan.name, &plan.used_stemcells())
        {
            warn!("failed to reconcile stemcell references: {}", e);
        }
        res
    }

    fn write_workfile(&self, path: &str, text: &str) -> Result<()> {
        let pth = Path::new(".").join(path);
        debug!("writing working manifest to {}", pth.display());
        let mut f = File::create(&pth)?;
        writeln!(f, "{}", text)?;
        Ok(())
    }

    fn ctx(&self, plan: &Plan) -> UpdateCtx {
        UpdateCtx {
            deployment: plan.name.clone(),
            store: self.store.clone(),
            cloud: self.cloud.clone(),
            agent: self.agent.clone(),
            clock: self.clock.clone(),
            cancel: self.cancel.clone(),
            poll_ms: self.config.poll_interval_ms,
            cap: self.config.max_in_flight,
        }
    }

    fn run(&self, plan: &mut Plan) -> Result<()> {
        let ctx = self.ctx(plan);
        let prepared = assemble::prepare(plan, &self.store, &self.log)?;
        self.compile_releases(plan)?;
        pools::update_pools(&ctx, plan, &self.log)?;
        self.delete_unneeded(&ctx, &prepared)?;
        let reports = batch::update_jobs(&ctx, plan, &self.log)?;
        self.commit(plan)?;

        for r in &reports {
            info!("{}: {:?} ({} instances)", r.job, r.state, r.updated);
        }
        info!("deployed {}", plan.name);
        Ok(())
    }

    fn compile_releases(&self, plan: &Plan) -> Result<()> {
        let stage = self.log.stage("Compiling packages", plan.releases.len() as u32);
        for rv in plan.releases.values() {
            stage.track(&format!("{}/{}", rv.name, rv.version), |_| {
                self.compiler.compile(&rv.name, &rv.version)
            })?;
        }
        Ok(())
    }

    // Obsolete records go down in parallel, bounded by the deployment cap
    fn delete_unneeded(&self, ctx: &UpdateCtx, prepared: &Prepared) -> Result<()> {
        let obsolete: &[InstanceRecord] = &prepared.obsolete;
        if obsolete.is_empty() {
            return Ok(());
        }
        let stage = self.log.stage("Deleting unneeded instances", obsolete.len() as u32);
        let workers = ::std::cmp::max(1, ::std::cmp::min(ctx.cap, obsolete.len()));
        let pool = ThreadPool::new(workers);
        let (tx, rx) = channel();
        for rec in obsolete {
            let task = stage.task(&format!("{}/{}", rec.job, rec.index));
            let tctx = ctx.clone();
            let trec = rec.clone();
            let tx = tx.clone();
            pool.execute(move || {
                task.start();
                let res = instance::delete_obsolete(&tctx, &trec, &task);
                match res {
                    Ok(_) => task.finish(),
                    Err(ref e) => task.fail(&format!("{}", e)),
                }
                tx.send(res).expect("channel will be there waiting for the pool");
            });
        }
        let failures: Vec<Error> = rx.iter().take(obsolete.len()).filter_map(Result::err).collect();
        match failures.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Rewrite the deployment's release set in one transaction, bracketed by
    // shared release locks that drop right after the commit.
    fn commit(&self, plan: &Plan) -> Result<()> {
        let mut held = vec![];
        for name in plan.releases.keys() {
            held.push(self.locks.release(name)?);
        }
        self.store
            .commit_deployment(&plan.name, &plan.manifest, &plan.release_set())?;
        drop(held);
        Ok(())
    }
}
