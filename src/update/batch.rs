use std::collections::BTreeMap;
use std::sync::mpsc::channel;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use threadpool::ThreadPool;

use eventlog::EventLog;
use plan::Plan;
use super::job::{update_job, JobReport};
use super::{Error, ErrorKind, Result, UpdateCtx};

/// Update every job of the plan, honoring serial barriers
///
/// Jobs are ordered by their declared update order (manifest order unless
/// `update.after` edges say otherwise), then partitioned into runs delimited
/// by serial jobs. Each run executes with all its jobs concurrent under the
/// deployment cap; a failure lets in-flight jobs reach quiescence, skips
/// every later run and propagates the first error.
pub fn update_jobs(ctx: &UpdateCtx, plan: &Plan, log: &EventLog) -> Result<Vec<JobReport>> {
    let order = order_jobs(plan)?;
    let runs = partition_runs(plan, &order);
    debug!(
        "job update runs: {:?}",
        runs.iter()
            .map(|r| r.iter().map(|i| plan.jobs[*i].name.clone()).collect::<Vec<_>>())
            .collect::<Vec<_>>()
    );

    let shared = Arc::new(plan.clone());
    let mut reports = vec![];
    for run in runs {
        ctx.cancel.check()?;
        let (mut ok, first_err) = execute_run(ctx, &shared, &run, log);
        reports.append(&mut ok);
        if let Some(e) = first_err {
            warn!("job update failed, skipping remaining runs");
            return Err(e);
        }
    }
    Ok(reports)
}

// Manifest order unless some job declares `after` edges; then a topological
// sort of the declared graph decides, and a cycle is a validation error.
fn order_jobs(plan: &Plan) -> Result<Vec<usize>> {
    if plan.jobs.iter().all(|j| j.update.after.is_empty()) {
        return Ok((0..plan.jobs.len()).collect());
    }
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: Vec<NodeIndex> = vec![];
    let mut by_name: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    for (i, job) in plan.jobs.iter().enumerate() {
        let n = graph.add_node(i);
        nodes.push(n);
        by_name.insert(job.name.as_str(), n);
    }
    for (i, job) in plan.jobs.iter().enumerate() {
        for dep in &job.update.after {
            graph.add_edge(by_name[dep.as_str()], nodes[i], ());
        }
    }
    match toposort(&graph, None) {
        Ok(sorted) => Ok(sorted.into_iter().map(|n| graph[n]).collect()),
        Err(_) => Err(ErrorKind::InvalidValue(
            "update.after".into(),
            "declared update order contains a cycle".into(),
        ).into()),
    }
}

// Serial jobs run alone; consecutive parallel jobs share a run.
fn partition_runs(plan: &Plan, order: &[usize]) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = vec![];
    let mut current: Vec<usize> = vec![];
    for &i in order {
        if plan.jobs[i].update.serial {
            if !current.is_empty() {
                runs.push(current);
                current = vec![];
            }
            runs.push(vec![i]);
        } else {
            current.push(i);
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn execute_run(
    ctx: &UpdateCtx,
    plan: &Arc<Plan>,
    run: &[usize],
    log: &EventLog,
) -> (Vec<JobReport>, Option<Error>) {
    if run.len() == 1 {
        let job = &plan.jobs[run[0]];
        return match update_job(ctx, plan, job, log) {
            Ok(r) => (vec![r], None),
            Err(e) => (vec![], Some(e)),
        };
    }

    let workers = ::std::cmp::max(1, ::std::cmp::min(ctx.cap, run.len()));
    let pool = ThreadPool::new(workers);
    let (tx, rx) = channel();
    for &i in run {
        let tctx = ctx.clone();
        let tplan = plan.clone();
        let tlog = log.clone();
        let tx = tx.clone();
        pool.execute(move || {
            let job = &tplan.jobs[i];
            let res = update_job(&tctx, &tplan, job, &tlog);
            tx.send(res).expect("channel will be there waiting for the pool");
        });
    }

    let mut reports = vec![];
    let mut first_err = None;
    for res in rx.iter().take(run.len()) {
        match res {
            Ok(r) => reports.push(r),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    (reports, first_err)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agent::MockAgent;
    use assemble;
    use clock::FakeClock;
    use cpi::MockCloud;
    use eventlog::{EventLog, MemorySink};
    use plan::{Plan, PlanOptions};
    use store::Store;
    use update::{Canceller, UpdateCtx};
    use super::{order_jobs, partition_runs, update_jobs};

    fn manifest(jobs: &[(&str, bool, &str)]) -> String {
        let mut lines = vec![
            "name: prod".to_string(),
            "releases:".to_string(),
            "- {name: app, version: 1}".to_string(),
            "networks:".to_string(),
            "- name: default".to_string(),
            "resource_pools:".to_string(),
            "- name: small".to_string(),
            "  size: 20".to_string(),
            "  network: default".to_string(),
            "  stemcell: {name: ubuntu, version: 1}".to_string(),
            "update:".to_string(),
            "  canary_watch_time: 100".to_string(),
            "  update_watch_time: 100".to_string(),
            "jobs:".to_string(),
        ];
        for (name, serial, after) in jobs {
            lines.push(format!("- name: {}", name));
            lines.push("  template: server".to_string());
            lines.push("  instances: 1".to_string());
            lines.push("  resource_pool: small".to_string());
            lines.push("  networks: [default]".to_string());
            lines.push(format!("  update: {{serial: {}{}}}", serial, after));
        }
        lines.join("\n")
    }

    fn rig(text: &str) -> (Plan, UpdateCtx, Arc<MockAgent>, EventLog, MemorySink) {
        let mut plan = Plan::parse(text, &PlanOptions::default()).unwrap();
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
        (plan, ctx, agent, log, sink)
    }

    #[test]
    fn serial_jobs_form_barriers() {
        let text = manifest(&[
            ("db", true, ""),
            ("web", false, ""),
            ("api", false, ""),
            ("smoke", true, ""),
        ]);
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        let order = order_jobs(&plan).unwrap();
        let runs = partition_runs(&plan, &order);
        assert_eq!(runs, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn declared_after_edges_reorder_jobs() {
        let text = manifest(&[
            ("web", true, ", after: [db]"),
            ("db", true, ""),
        ]);
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        let order = order_jobs(&plan).unwrap();
        let names: Vec<&str> = order.iter().map(|i| plan.jobs[*i].name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);
    }

    #[test]
    fn update_order_cycles_are_rejected() {
        let text = manifest(&[
            ("web", true, ", after: [db]"),
            ("db", true, ", after: [web]"),
        ]);
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        assert!(order_jobs(&plan).is_err());
    }

    #[test]
    fn all_jobs_update_and_serial_ordering_holds() {
        let text = manifest(&[("db", true, ""), ("web", true, "")]);
        let (plan, ctx, _agent, log, sink) = rig(&text);
        let reports = update_jobs(&ctx, &plan, &log).unwrap();
        log.close();
        assert_eq!(reports.len(), 2);

        let evs = sink.events();
        let last_db = evs
            .iter()
            .rposition(|e| e.stage == "Updating job db")
            .unwrap();
        let first_web = evs
            .iter()
            .position(|e| e.stage == "Updating job web")
            .unwrap();
        assert!(last_db < first_web);
    }

    #[test]
    fn a_failing_run_cancels_later_runs() {
        let text = manifest(&[("db", true, ""), ("web", true, "")]);
        let (plan, ctx, agent, log, sink) = rig(&text);
        agent.fail_apply("db", 0);
        assert!(update_jobs(&ctx, &plan, &log).is_err());
        log.close();

        let evs = sink.events();
        assert!(evs.iter().any(|e| e.stage == "Updating job db"));
        assert!(evs.iter().all(|e| e.stage != "Updating job web"));
    }

    #[test]
    fn parallel_jobs_share_a_run() {
        let text = manifest(&[("web", false, ""), ("api", false, "")]);
        let (plan, ctx, _agent, log, sink) = rig(&text);
        let reports = update_jobs(&ctx, &plan, &log).unwrap();
        log.close();
        assert_eq!(reports.len(), 2);
        let evs = sink.events();
        assert!(evs.iter().any(|e| e.stage == "Updating job web"));
        assert!(evs.iter().any(|e| e.stage == "Updating job api"));
    }
}
