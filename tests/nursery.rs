//! Covers task naming, duplicate-name rejection, the four failure policies,
//! and main-task failure always cancelling children and surfacing regardless
//! of policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nursery_csp::{scope, FailurePolicy, Nursery, NurseryError};

async fn nop(millis: u64) -> Result<(), String> {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(())
}

async fn nop_err(millis: u64) -> Result<(), String> {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Err("booo!".to_string())
}

#[tokio::test]
async fn auto_generated_task_names_are_monotonic_from_one() {
    let result: Result<(), NurseryError<String>> =
        scope(FailurePolicy::IgnoreSilently, |n: Nursery<String>| async move {
            for i in 1..=5 {
                let handle = n.start(nop(5), None).unwrap();
                assert_eq!(handle.name(), format!("task-{i}"));
            }
            Ok(())
        })
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn custom_task_name_is_reachable_by_lookup() {
    let result: Result<(), NurseryError<String>> =
        scope(FailurePolicy::IgnoreSilently, |n: Nursery<String>| async move {
            n.start(nop(20), Some("aaa".to_string())).unwrap();
            assert!(n.get_task_by_name("aaa").is_some());
            assert!(n.get_task_by_name("bbb").is_none());
            Ok(())
        })
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn duplicate_task_name_is_rejected() {
    let result: Result<(), NurseryError<String>> =
        scope(FailurePolicy::IgnoreSilently, |n: Nursery<String>| async move {
            n.start(nop(20), Some("aaa".to_string())).unwrap();
            let err = n.start(nop(20), Some("aaa".to_string())).unwrap_err();
            assert!(matches!(err, NurseryError::DuplicateName(name) if name == "aaa"));
            Ok(())
        })
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn all_children_are_settled_before_scope_returns_on_success() {
    let finished = Arc::new(AtomicUsize::new(0));
    let result: Result<(), NurseryError<String>> = scope(FailurePolicy::IgnoreSilently, {
        let finished = finished.clone();
        |n: Nursery<String>| async move {
            for _ in 0..3 {
                let finished = finished.clone();
                n.start(
                    async move {
                        nop(15).await?;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    None,
                )
                .unwrap();
            }
            Ok(())
        }
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(finished.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn ignore_silently_swallows_child_failures() {
    let result: Result<(), NurseryError<String>> =
        scope(FailurePolicy::IgnoreSilently, |n: Nursery<String>| async move {
            n.start(nop_err(5), None).unwrap();
            n.start(nop(30), None).unwrap();
            Ok(())
        })
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn ignore_and_raise_surfaces_the_child_error_without_cancelling_siblings() {
    let sibling_ran = Arc::new(AtomicUsize::new(0));
    let result: Result<(), NurseryError<String>> = scope(FailurePolicy::IgnoreAndRaise, {
        let sibling_ran = sibling_ran.clone();
        |n: Nursery<String>| async move {
            n.start(nop_err(5), Some("failing".to_string())).unwrap();
            let sibling_ran = sibling_ran.clone();
            n.start(
                async move {
                    nop(30).await?;
                    sibling_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Some("sibling".to_string()),
            )
            .unwrap();
            Ok(())
        }
    })
    .await;

    match result {
        Err(NurseryError::ChildFailure { name, error }) => {
            assert_eq!(name, "failing");
            assert_eq!(error, "booo!");
        }
        other => panic!("expected ChildFailure, got {other:?}"),
    }
    // The sibling was never cancelled under this policy, so it completed.
    assert_eq!(sibling_ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_siblings_and_raise_cancels_the_sibling_before_it_finishes() {
    let sibling_ran = Arc::new(AtomicUsize::new(0));
    let result: Result<(), NurseryError<String>> = scope(FailurePolicy::CancelSiblingsAndRaise, {
        let sibling_ran = sibling_ran.clone();
        |n: Nursery<String>| async move {
            n.start(nop_err(5), Some("failing".to_string())).unwrap();
            let sibling_ran = sibling_ran.clone();
            n.start(
                async move {
                    nop(200).await?;
                    sibling_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Some("sibling".to_string()),
            )
            .unwrap();
            nop(100).await
        }
    })
    .await;

    assert!(matches!(result, Err(NurseryError::ChildFailure { .. })));
    // Cancelled well before its 200ms sleep would have completed.
    assert_eq!(sibling_ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_siblings_silently_cancels_but_swallows_the_error() {
    let sibling_ran = Arc::new(AtomicUsize::new(0));
    let result: Result<(), NurseryError<String>> = scope(FailurePolicy::CancelSiblingsSilently, {
        let sibling_ran = sibling_ran.clone();
        |n: Nursery<String>| async move {
            n.start(nop_err(5), None).unwrap();
            let sibling_ran = sibling_ran.clone();
            n.start(
                async move {
                    nop(200).await?;
                    sibling_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                None,
            )
            .unwrap();
            nop(100).await
        }
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(sibling_ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn main_task_failure_always_cancels_children_and_surfaces_regardless_of_policy() {
    for policy in [
        FailurePolicy::IgnoreSilently,
        FailurePolicy::CancelSiblingsSilently,
        FailurePolicy::IgnoreAndRaise,
        FailurePolicy::CancelSiblingsAndRaise,
    ] {
        let child_ran = Arc::new(AtomicUsize::new(0));
        let result: Result<(), NurseryError<String>> = scope(policy, {
            let child_ran = child_ran.clone();
            |n: Nursery<String>| async move {
                let child_ran = child_ran.clone();
                n.start(
                    async move {
                        nop(200).await?;
                        child_ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    None,
                )
                .unwrap();
                nop_err(5).await
            }
        })
        .await;

        match result {
            Err(NurseryError::MainTaskFailure(error)) => assert_eq!(error, "booo!"),
            other => panic!("policy {policy:?}: expected MainTaskFailure, got {other:?}"),
        }
        assert_eq!(
            child_ran.load(Ordering::SeqCst),
            0,
            "policy {policy:?}: child must be cancelled before its sleep elapses"
        );
    }
}
