use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::mpsc::channel;

use threadpool::ThreadPool;

use eventlog::EventLog;
use plan::{Plan, ResourcePool, TargetState};
use store::VmRecord;
use super::{Error, Result, UpdateCtx};

enum PoolOp {
    /// Idle VM on an outdated stemcell, or surplus after a pool shrink
    Delete(String),
    /// Missing idle VM
    Create,
}

/// Reconcile every resource pool against its declared size and stemcell
///
/// Per pool the target is `idle + allocated == size` with all idle VMs on
/// the pool's current stemcell. Pools reconcile independently and in
/// parallel; a single failed VM operation fails its task and aborts the
/// stage.
pub fn update_pools(ctx: &UpdateCtx, plan: &Plan, log: &EventLog) -> Result<()> {
    let bound: BTreeSet<String> = plan.instances.iter().filter_map(|i| i.vm.clone()).collect();
    let mut work: BTreeMap<String, Vec<PoolOp>> = BTreeMap::new();

    for (name, pool) in &plan.pools {
        let mut ops = vec![];
        let idle = ctx.store.idle_vms(&ctx.deployment, name)?;
        let mut good: Vec<String> = vec![];
        for vm in &idle {
            if vm.stemcell != pool.stemcell.id() {
                ops.push(PoolOp::Delete(vm.cid.clone()));
            } else if !bound.contains(&vm.cid) {
                good.push(vm.cid.clone());
            }
        }
        let allocated_target = plan
            .instances
            .iter()
            .filter(|i| &i.pool == name && i.target != TargetState::Detached)
            .count();
        // a shrunken pool sheds current-stemcell idle VMs too; allocated
        // instances never exceed the size, so surplus fits within `good`
        let surplus = (allocated_target + good.len()).saturating_sub(pool.size as usize);
        for cid in good.drain(..surplus) {
            ops.push(PoolOp::Delete(cid));
        }
        let missing = (pool.size as usize).saturating_sub(allocated_target + good.len());
        for _ in 0..missing {
            ops.push(PoolOp::Create);
        }
        if !ops.is_empty() {
            work.insert(name.clone(), ops);
        }
    }

    let total: usize = work.values().map(|ops| ops.len()).sum();
    if total == 0 {
        debug!("all resource pools are converged");
        return Ok(());
    }

    let stage = log.stage("Updating resource pools", total as u32);
    let workers = ::std::cmp::max(1, ::std::cmp::min(ctx.cap, work.len()));
    let threads = ThreadPool::new(workers);
    let (tx, rx) = channel();
    let n_pools = work.len();

    for (name, ops) in work {
        let pool = plan.pools[&name].clone();
        let tctx = ctx.clone();
        let tstage = stage.clone();
        let tx = tx.clone();
        threads.execute(move || {
            let mut res = Ok(());
            for op in ops {
                if tctx.cancel.cancelled() {
                    break;
                }
                let label = match op {
                    PoolOp::Delete(ref cid) => format!("{} delete {}", pool.name, cid),
                    PoolOp::Create => format!("{} create", pool.name),
                };
                let outcome = tstage.track(&label, |_| apply_op(&tctx, &pool, &op));
                if let Err(e) = outcome {
                    res = Err(e);
                    break; // remaining ops of this pool are pointless
                }
            }
            tx.send(res).expect("channel will be there waiting for the pool");
        });
    }

    let failures: Vec<Error> = rx.iter().take(n_pools).filter_map(Result::err).collect();
    match failures.into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn apply_op(ctx: &UpdateCtx, pool: &ResourcePool, op: &PoolOp) -> Result<()> {
    match op {
        PoolOp::Delete(cid) => {
            ctx.cloud.delete_vm(cid)?;
            let cid = cid.clone();
            ctx.store.transaction(move |t| {
                t.vms.remove(&cid);
                Ok(())
            })
        }
        PoolOp::Create => {
            let networks = vec![pool.network.clone()];
            let cid = ctx
                .cloud
                .create_vm(&pool.stemcell.id(), &pool.cloud_properties, &networks, &[])?;
            let rec = VmRecord {
                cid: cid.clone(),
                deployment: ctx.deployment.clone(),
                pool: pool.name.clone(),
                stemcell: pool.stemcell.id(),
                idle: true,
            };
            ctx.store.transaction(move |t| {
                t.vms.insert(rec.cid.clone(), rec);
                Ok(())
            })
        }
    }
}
