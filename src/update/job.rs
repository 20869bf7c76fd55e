use std::sync::mpsc::channel;

use threadpool::ThreadPool;

use assemble;
use eventlog::{EventLog, Stage};
use plan::{Action, Instance, Job, Plan};
use super::{instance, Error, Result, UpdateCtx};

/// Per-job rollout phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Canaries,
    Batches,
    Done,
    Halted,
}

pub struct JobReport {
    pub job: String,
    pub state: JobState,
    pub updated: usize,
}

/// Canary-then-batch rollout of one job
///
/// The canary set runs first with concurrency `min(canaries, max_in_flight)`
/// and gates everything else: any canary failure halts the job before a
/// single batch instance is touched. The rest run in fixed batches of
/// `max_in_flight`; a failing batch drains its in-flight siblings and then
/// halts. Batch N always completes before batch N+1 starts.
pub fn update_job(ctx: &UpdateCtx, plan: &Plan, job: &Job, log: &EventLog) -> Result<JobReport> {
    let targets: Vec<Instance> = plan
        .instances_of(&job.name)
        .into_iter()
        .filter(|i| i.action != Action::Noop)
        .cloned()
        .collect();
    let mut report = JobReport {
        job: job.name.clone(),
        state: JobState::Idle,
        updated: 0,
    };
    if targets.is_empty() {
        debug!("job {} is already converged", job.name);
        report.state = JobState::Done;
        return Ok(report);
    }

    let stage = log.stage(&format!("Updating job {}", job.name), targets.len() as u32);
    let max_in_flight = job.update.max_in_flight as usize;
    let canary_n = ::std::cmp::min(job.update.canaries as usize, targets.len());

    report.state = JobState::Canaries;
    if canary_n > 0 {
        let workers = clamp_workers(::std::cmp::min(canary_n, max_in_flight), ctx.cap);
        if let Err(e) = run_batch(ctx, plan, job, &stage, &targets[..canary_n], workers, true) {
            warn!("halting job {}: canary failed: {}", job.name, e);
            report.state = JobState::Halted;
            return Err(e);
        }
        report.updated += canary_n;
    }

    report.state = JobState::Batches;
    for batch in targets[canary_n..].chunks(max_in_flight) {
        ctx.cancel.check()?;
        let workers = clamp_workers(batch.len(), ctx.cap);
        if let Err(e) = run_batch(ctx, plan, job, &stage, batch, workers, false) {
            warn!("halting job {}: batch failed: {}", job.name, e);
            report.state = JobState::Halted;
            return Err(e);
        }
        report.updated += batch.len();
    }

    report.state = JobState::Done;
    info!("updated {} instances of job {}", report.updated, job.name);
    Ok(report)
}

fn clamp_workers(wanted: usize, cap: usize) -> usize {
    ::std::cmp::max(1, ::std::cmp::min(wanted, cap))
}

// One concurrent batch. Waits for every in-flight sibling before returning
// and propagates the first error, so a failure never leaks work into the
// next batch.
fn run_batch(
    ctx: &UpdateCtx,
    plan: &Plan,
    job: &Job,
    stage: &Stage,
    batch: &[Instance],
    workers: usize,
    canary: bool,
) -> Result<()> {
    let pool = ThreadPool::new(workers);
    let (tx, rx) = channel();
    for inst in batch {
        let label = if canary {
            format!("{}/{} (canary)", job.name, inst.index)
        } else {
            format!("{}/{}", job.name, inst.index)
        };
        let tags = if canary { vec!["canary".to_string()] } else { vec![] };
        let task = stage.task_tagged(&label, tags);

        // satisfying thread safety
        let tctx = ctx.clone();
        let tinst = inst.clone();
        let spec = assemble::target_spec(plan, inst);
        let tpool = plan.pools[&inst.pool].clone();
        let watch = if canary {
            job.update.canary_watch_time
        } else {
            job.update.update_watch_time
        };

        let tx = tx.clone(); // tx channel reused in each thread
        pool.execute(move || {
            task.start();
            let res = instance::run(&tctx, &tinst, &tpool, &spec, &watch, &task);
            match res {
                Ok(_) => task.finish(),
                Err(ref e) => task.fail(&format!("{}", e)),
            }
            tx.send(res).expect("channel will be there waiting for the pool");
        });
    }

    // wait for the whole batch, then surface the first error
    let failures: Vec<Error> = rx.iter().take(batch.len()).filter_map(Result::err).collect();
    match failures.into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agent::MockAgent;
    use assemble;
    use clock::FakeClock;
    use cpi::MockCloud;
    use eventlog::{EventLog, MemorySink, TaskState};
    use plan::{Plan, PlanOptions};
    use store::Store;
    use update::{Canceller, UpdateCtx};
    use super::{update_job, JobState};

    fn manifest(instances: u32, canaries: u32, max_in_flight: u32) -> String {
        [
            "name: prod".to_string(),
            "releases:".to_string(),
            "- {name: app, version: 1}".to_string(),
            "networks:".to_string(),
            "- name: default".to_string(),
            "resource_pools:".to_string(),
            "- name: small".to_string(),
            format!("  size: {}", instances),
            "  network: default".to_string(),
            "  stemcell: {name: ubuntu, version: 1}".to_string(),
            "update:".to_string(),
            format!("  canaries: {}", canaries),
            format!("  max_in_flight: {}", max_in_flight),
            "  canary_watch_time: 100-400".to_string(),
            "  update_watch_time: 100-400".to_string(),
            "jobs:".to_string(),
            "- name: web".to_string(),
            "  template: server".to_string(),
            format!("  instances: {}", instances),
            "  resource_pool: small".to_string(),
            "  networks: [default]".to_string(),
        ].join("\n")
    }

    struct Rig {
        plan: Plan,
        ctx: UpdateCtx,
        agent: Arc<MockAgent>,
        log: EventLog,
        sink: MemorySink,
    }

    fn rig(instances: u32, canaries: u32, max_in_flight: u32) -> Rig {
        let mut plan = Plan::parse(&manifest(instances, canaries, max_in_flight), &PlanOptions::default()).unwrap();
        let store = Store::new();
        let clock = Arc::new(FakeClock::at(0));
        let sink = MemorySink::new();
        let log = EventLog::new(Box::new(sink.clone()), clock.clone(), 1024);
        assemble::prepare(&mut plan, &store, &log).unwrap();
        let agent = Arc::new(MockAgent::new());
        let ctx = UpdateCtx {
            deployment: "prod".into(),
            store,
            cloud: Arc::new(MockCloud::new()),
            agent: agent.clone(),
            clock,
            cancel: Canceller::new(),
            poll_ms: 50,
            cap: 8,
        };
        Rig { plan, ctx, agent, log, sink }
    }

    #[test]
    fn canary_failure_halts_before_any_batch_starts() {
        let r = rig(5, 1, 2);
        r.agent.fail_apply("web", 0);
        let job = r.plan.job("web").unwrap();
        let res = update_job(&r.ctx, &r.plan, job, &r.log);
        assert!(res.is_err());
        r.log.close();

        let evs: Vec<_> = r
            .sink
            .events()
            .into_iter()
            .filter(|e| e.stage == "Updating job web")
            .collect();
        // exactly one started and one failed event, both for the canary
        assert_eq!(evs.iter().filter(|e| e.state == TaskState::Started).count(), 1);
        assert_eq!(evs.iter().filter(|e| e.state == TaskState::Failed).count(), 1);
        assert!(evs.iter().all(|e| e.index == 1));
        assert!(evs
            .iter()
            .filter(|e| e.state == TaskState::Started)
            .all(|e| e.tags == vec!["canary".to_string()]));
        // only the canary ever reached the agent
        assert!(r.agent.max_concurrent_applies() <= 1);
        // the store still has no record for any instance
        assert_eq!(r.ctx.store.instances_of("prod").unwrap().len(), 0);
    }

    #[test]
    fn canaries_complete_before_batches_and_batches_stay_bounded() {
        let r = rig(5, 1, 2);
        let job = r.plan.job("web").unwrap();
        let report = update_job(&r.ctx, &r.plan, job, &r.log).unwrap();
        r.log.close();
        assert_eq!(report.state, JobState::Done);
        assert_eq!(report.updated, 5);

        let evs: Vec<_> = r
            .sink
            .events()
            .into_iter()
            .filter(|e| e.stage == "Updating job web")
            .collect();
        // canary terminal precedes every non-canary start
        let canary_done = evs
            .iter()
            .position(|e| e.index == 1 && e.state == TaskState::Finished)
            .unwrap();
        let first_batch_start = evs
            .iter()
            .position(|e| e.index > 1 && e.state == TaskState::Started)
            .unwrap();
        assert!(canary_done < first_batch_start);

        // batch one (indices 2,3) fully terminal before batch two (4,5) starts
        let batch1_done = evs
            .iter()
            .enumerate()
            .filter(|&(_, e)| (e.index == 2 || e.index == 3) && e.state == TaskState::Finished)
            .map(|(i, _)| i)
            .max()
            .unwrap();
        let batch2_start = evs
            .iter()
            .position(|e| e.index > 3 && e.state == TaskState::Started)
            .unwrap();
        assert!(batch1_done < batch2_start);

        // never more than max_in_flight instances applying at once
        assert!(r.agent.max_concurrent_applies() <= 2);
        // every instance record landed
        assert_eq!(r.ctx.store.instances_of("prod").unwrap().len(), 5);
    }

    #[test]
    fn batch_failure_drains_siblings_then_halts() {
        let r = rig(6, 1, 2);
        r.agent.fail_apply("web", 2);
        let job = r.plan.job("web").unwrap();
        assert!(update_job(&r.ctx, &r.plan, job, &r.log).is_err());
        r.log.close();

        let evs: Vec<_> = r
            .sink
            .events()
            .into_iter()
            .filter(|e| e.stage == "Updating job web")
            .collect();
        // canary plus first batch ran; second batch never started
        let started: Vec<u32> = evs
            .iter()
            .filter(|e| e.state == TaskState::Started)
            .map(|e| e.index)
            .collect();
        assert!(started.contains(&1));
        assert!(started.contains(&2) && started.contains(&3));
        assert!(!started.contains(&4) && !started.contains(&5));
        // the sibling of the failed instance still reached a terminal state
        let terminals = evs
            .iter()
            .filter(|e| e.state == TaskState::Finished || e.state == TaskState::Failed)
            .count();
        assert_eq!(terminals, 3);
    }

    #[test]
    fn converged_jobs_skip_their_stage() {
        let mut r = rig(2, 1, 1);
        for inst in r.plan.instances.iter_mut() {
            inst.action = ::plan::Action::Noop;
        }
        let job = r.plan.job("web").unwrap().clone();
        let report = update_job(&r.ctx, &r.plan, &job, &r.log).unwrap();
        r.log.close();
        assert_eq!(report.state, JobState::Done);
        assert_eq!(report.updated, 0);
        assert!(r.sink.events().iter().all(|e| e.stage != "Updating job web"));
    }
}
