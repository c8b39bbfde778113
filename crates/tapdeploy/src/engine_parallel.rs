//! Parallel market runner.
//!
//! Markets run in waves of at most `parallel.max_concurrent` workers. Each
//! worker reports into its own buffer, replayed in market order after the
//! wave joins, so operator output stays grouped per market.

use std::thread;

use anyhow::Result;
use tapdeploy_types::{Market, MarketReceipt};

use crate::engine::{BufferedReporter, Reporter, RunContext, deploy_market};
use crate::plan::RunPlan;

pub(crate) fn run_markets_parallel(
    ctx: &RunContext<'_>,
    plan: &RunPlan,
    reporter: &mut dyn Reporter,
) -> Result<(Vec<MarketReceipt>, Vec<Market>)> {
    let max_concurrent = ctx.opts.parallel.max_concurrent.max(1);
    reporter.info(&format!(
        "parallel mode: up to {max_concurrent} market(s) at a time"
    ));

    let mut receipts = Vec::with_capacity(plan.markets.len());
    let mut not_started = Vec::new();

    for wave in plan.markets.chunks(max_concurrent) {
        let results: Vec<Result<(Option<MarketReceipt>, BufferedReporter)>> =
            thread::scope(|scope| {
                let handles: Vec<_> = wave
                    .iter()
                    .map(|paths| {
                        scope.spawn(move || {
                            let mut buffered = BufferedReporter::default();
                            if ctx.cancel.is_cancelled() {
                                return (None, buffered);
                            }
                            let receipt = deploy_market(ctx, paths, &mut buffered);
                            (Some(receipt), buffered)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join()
                            .map_err(|_| anyhow::anyhow!("market worker thread panicked"))
                    })
                    .collect()
            });

        for (paths, result) in wave.iter().zip(results) {
            let (receipt, buffered) = result?;
            buffered.replay(reporter);
            match receipt {
                Some(r) => receipts.push(r),
                None => not_started.push(paths.market.clone()),
            }
        }
        ctx.events.flush()?;
    }

    Ok((receipts, not_started))
}
