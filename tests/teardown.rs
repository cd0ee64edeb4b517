// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::runtime::Runtime;

    use xidis_lib::{
        executor::script::Operation,
        fabric::Fabric,
        phase::{Direction, Phase},
        record::{Outcome, RunOutcome, RunRecord, RunRecorder, SkipReason},
        scope::ScopeRequest,
        test_env::*,
        EngineOptions, PipelineEngine,
    };

    fn engine(executor: &Arc<MockExecutor>) -> PipelineEngine {
        PipelineEngine::new(
            executor.clone(),
            EngineOptions {
                workers: 4,
                operation_timeout: Duration::from_secs(5),
            },
        )
    }

    fn run(engine: &PipelineEngine, fabric: &Fabric, request: ScopeRequest) -> RunRecord {
        let rt = Runtime::new().unwrap();
        rt.block_on(engine.run(fabric, &request, &RunRecorder::in_memory(1)))
            .unwrap()
    }

    fn teardown() -> ScopeRequest {
        ScopeRequest {
            teardown: true,
            ..Default::default()
        }
    }

    /// The distinct phases of `record`, in the order they first appear.
    fn phase_order(record: &RunRecord) -> Vec<Phase> {
        let mut order: Vec<Phase> = Vec::new();
        for result in record.results.iter() {
            if order.last() != Some(&result.phase) {
                order.push(result.phase);
            }
        }
        order
    }

    #[test]
    fn teardown_reverts_a_deployed_fabric_in_reverse() {
        let fabric = sample_fabric();
        let executor = Arc::new(MockExecutor::new());
        let engine = engine(&executor);

        assert_eq!(
            run(&engine, &fabric, ScopeRequest::default()).outcome,
            RunOutcome::Succeeded
        );
        executor.reset_calls();

        let record = run(&engine, &fabric, teardown());

        assert_eq!(record.direction, Direction::Teardown);
        assert_eq!(record.outcome, RunOutcome::Succeeded);
        assert_eq!(
            phase_order(&record),
            vec![
                Phase::Reexport,
                Phase::OpusRaid,
                Phase::AggregatorConnect,
                Phase::StorageExport,
            ]
        );
        assert!(record.results.iter().all(|r| r.outcome == Outcome::Succeeded));

        for phase in Phase::ALL.iter().filter(|p| p.mutates()) {
            for host in ["agg01", "both01", "stor01", "stor02"] {
                assert!(!executor.is_configured(*phase, host));
            }
        }
        assert!(executor
            .mutating_calls()
            .iter()
            .all(|c| c.op == Operation::Revert));
        assert_eq!(executor.mutating_calls().len(), 8);
    }

    #[test]
    fn teardown_of_an_empty_fabric_changes_nothing() {
        let fabric = sample_fabric();
        let executor = Arc::new(MockExecutor::new());

        let record = run(&engine(&executor), &fabric, teardown());

        assert_eq!(record.outcome, RunOutcome::Succeeded);
        assert!(executor.mutating_calls().is_empty());
        assert!(!record.results.is_empty());
        for result in record.results.iter() {
            assert_eq!(result.outcome, Outcome::Skipped);
            assert_eq!(result.reason, Some(SkipReason::AlreadyInState));
            assert_eq!(result.message.as_deref(), Some("nothing to revert"));
        }
    }

    #[test]
    fn teardown_after_a_partial_deploy_reverts_what_was_applied() {
        let fabric = sample_fabric();
        let executor = Arc::new(MockExecutor::new());
        let engine = engine(&executor);
        executor.inject(
            Phase::AggregatorConnect,
            "agg01",
            Fault::Fail("connect refused".to_string()),
        );

        assert_eq!(
            run(&engine, &fabric, ScopeRequest::default()).outcome,
            RunOutcome::Failed
        );
        executor.clear_faults();
        executor.reset_calls();

        let record = run(&engine, &fabric, teardown());

        assert_eq!(record.outcome, RunOutcome::Succeeded);
        for phase in [Phase::Reexport, Phase::OpusRaid, Phase::AggregatorConnect] {
            let result = record.result(phase, "agg01").unwrap();
            assert_eq!(result.outcome, Outcome::Skipped);
            assert_eq!(result.reason, Some(SkipReason::AlreadyInState));
        }
        assert!(executor
            .mutating_calls()
            .iter()
            .all(|c| c.host != "agg01"));
        assert_eq!(
            record.result(Phase::StorageExport, "stor01").unwrap().outcome,
            Outcome::Succeeded
        );
    }

    #[test]
    fn teardown_failure_excludes_only_that_host() {
        let fabric = sample_fabric();
        let executor = Arc::new(MockExecutor::new());
        let engine = engine(&executor);
        run(&engine, &fabric, ScopeRequest::default());

        executor.inject(
            Phase::OpusRaid,
            "both01",
            Fault::Fail("array in use".to_string()),
        );
        let record = run(&engine, &fabric, teardown());

        assert_eq!(record.outcome, RunOutcome::Failed);
        assert_eq!(
            record.result(Phase::OpusRaid, "both01").unwrap().outcome,
            Outcome::Failed
        );
        for phase in [Phase::AggregatorConnect, Phase::StorageExport] {
            assert_eq!(
                record.result(phase, "both01").unwrap().reason,
                Some(SkipReason::Excluded {
                    after: Phase::OpusRaid
                })
            );
        }
        assert!(executor.is_configured(Phase::StorageExport, "both01"));

        assert!(!executor.is_configured(Phase::OpusRaid, "agg01"));
        assert!(!executor.is_configured(Phase::StorageExport, "stor01"));
    }

    #[test]
    fn checks_cannot_be_selected_for_teardown() {
        let fabric = sample_fabric();
        let executor = Arc::new(MockExecutor::new());

        let err = engine(&executor)
            .resolve(
                &fabric,
                &ScopeRequest {
                    phase: Some("verify".to_string()),
                    teardown: true,
                    ..Default::default()
                },
            )
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid scope: phase 'verify' has no teardown action"
        );
    }

    #[test]
    fn dry_run_teardown_reports_planned_reverts() {
        let fabric = sample_fabric();
        let executor = Arc::new(MockExecutor::new());
        let engine = engine(&executor);
        run(&engine, &fabric, ScopeRequest::default());
        executor.reset_calls();

        let record = run(
            &engine,
            &fabric,
            ScopeRequest {
                dry_run: true,
                teardown: true,
                ..Default::default()
            },
        );

        assert!(executor.mutating_calls().is_empty());
        assert!(executor.is_configured(Phase::Reexport, "agg01"));
        assert_eq!(
            record.result(Phase::Reexport, "agg01").unwrap().message.as_deref(),
            Some("dry-run: would revert reexport")
        );
    }
}
