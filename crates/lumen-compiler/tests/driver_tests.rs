/// Integration tests for the compile-and-run driver

use std::path::Path;

use lumen_compiler::{
    Buffer, CompileError, Driver, FileSystem, MemoryFs, ModuleKind, ModuleRequest, ModuleResolver, RunOptions,
    RunResult,
};
use lumen_eval::{FragmentKind, RuntimeOptions, RuntimeState};

fn driver(fs: MemoryFs) -> Driver<MemoryFs> {
    Driver::new(ModuleResolver::new(fs))
}

fn error_message(result: &RunResult) -> &str {
    match result {
        RunResult::Error { message } => message,
        other => panic!("expected an error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_successful_run_completes() {
    let mut driver = driver(MemoryFs::new());
    let controller = driver.controller();

    let result = driver
        .run(
            r#"
(defn greet [who] (str "hello, " who))
(println (greet "lumen"))
(-> 5 (* 2) inc)
"#,
        )
        .await;

    assert_eq!(result, RunResult::Success { value: "11".into() });
    assert_eq!(controller.state(), Some(RuntimeState::Completed));
    assert_eq!(controller.contents(), "hello, lumen");
}

#[tokio::test]
async fn test_halt_stops_an_infinite_loop() {
    let mut driver = driver(MemoryFs::new()).with_options(
        RunOptions::new().runtime(RuntimeOptions::new().yield_interval(10)),
    );
    let controller = driver.controller();

    let run = driver.run("(loop [i 0] (println i) (recur (inc i)))");
    let halter = async {
        loop {
            if controller.output().is_some_and(|output| output.len() >= 3) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(controller.halt());
        controller.output().map(|output| output.len()).unwrap_or_default()
    };
    let (result, printed_at_halt) = tokio::join!(run, halter);

    assert_eq!(error_message(&result), "Execution halted");
    assert_eq!(controller.state(), Some(RuntimeState::Halted));
    assert_eq!(controller.wait_settled().await, Some(RuntimeState::Halted));

    // The loop prints nothing once the halt is requested.
    let fragments = controller.output().unwrap().fragments();
    let printed = fragments.iter().filter(|f| f.kind == FragmentKind::Output).count();
    assert_eq!(printed, printed_at_halt);
    assert_eq!(fragments.len(), printed_at_halt + 1);
    let last = fragments.last().unwrap();
    assert_eq!(last.kind, FragmentKind::Error);
    assert_eq!(last.text, "Execution halted");

    // Each yield happens after 10 checkpoints and each iteration passes a few.
    let checkpoints = driver.session().unwrap().sandbox().checkpoints();
    assert!(checkpoints < 100, "took {} checkpoints", checkpoints);
}

#[tokio::test]
async fn test_deep_nesting_is_a_read_error() {
    let mut driver = driver(MemoryFs::new());
    let source = format!("{}1{}", "[".repeat(1000), "]".repeat(1000));

    let result = driver.run(&source).await;
    assert!(error_message(&result).starts_with("Read error in untitled"), "{:?}", result);

    let nested = format!("(count {}1{})", "[".repeat(40), "]".repeat(40));
    assert_eq!(driver.run(&nested).await, RunResult::Success { value: "1".into() });
}

#[tokio::test]
async fn test_runs_do_not_share_state() {
    let mut driver = driver(MemoryFs::new());
    let controller = driver.controller();

    let first = driver.run("(def counter (atom 0)) (swap! counter inc) (println \"first\")").await;
    assert!(first.is_success());
    let first_output = controller.output().unwrap();

    let second = driver.run("counter").await;
    assert!(error_message(&second).contains("counter"), "{:?}", second);
    assert_eq!(first_output.contents(), "first");
    assert!(!controller.contents().contains("first"));
}

#[tokio::test]
async fn test_requires_load_from_the_filesystem() {
    let fs = MemoryFs::new()
        .with_file(
            "app/util.cljs",
            "(ns app.util) (println \"loading util\") (defn double [x] (* 2 x))",
        )
        .with_file("app/shared.cljc", "(ns app.shared (:require app.util)) (def base 10)");
    let mut driver = driver(fs);
    let controller = driver.controller();

    let result = driver
        .run("(ns app.main (:require [app.util :as u] [app.shared :refer [base]])) (u/double base)")
        .await;

    assert_eq!(result, RunResult::Success { value: "20".into() });
    // app.util is loaded once even though two namespaces require it.
    assert_eq!(controller.contents(), "loading util");
}

#[tokio::test]
async fn test_missing_module_is_reported() {
    let mut driver = driver(MemoryFs::new());
    let controller = driver.controller();

    let result = driver.run("(ns app.main (:require app.nowhere)) (println \"never\")").await;

    assert_eq!(
        error_message(&result),
        "Module not found: 'app.nowhere' required from app.main"
    );
    assert_eq!(controller.contents(), "Module not found: 'app.nowhere' required from app.main");
}

#[tokio::test]
async fn test_read_error_executes_nothing() {
    let mut driver = driver(MemoryFs::new());
    let controller = driver.controller();

    let result = driver.run("(println \"partial\") (println").await;

    assert!(error_message(&result).starts_with("Read error in untitled"), "{:?}", result);
    assert_eq!(controller.state(), Some(RuntimeState::Idle));
    let fragments = controller.output().unwrap().fragments();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].kind, FragmentKind::Error);
}

#[tokio::test]
async fn test_semantic_and_runtime_errors() {
    let mut driver = driver(MemoryFs::new());
    let controller = driver.controller();

    let result = driver.run("(cond true)").await;
    assert!(error_message(&result).starts_with("Semantic error in untitled"), "{:?}", result);

    let result = driver.run("(println \"before\") (throw (ex-info \"boom\" {}))").await;
    assert_eq!(error_message(&result), "boom");
    assert_eq!(controller.state(), Some(RuntimeState::Errored));
    assert_eq!(controller.contents(), "before\nboom");
}

#[tokio::test]
async fn test_buffer_round_trip_through_the_filesystem() {
    let fs = MemoryFs::new();
    let mut buffer = Buffer::new();
    buffer.set_text("(ns notes.scratch)\n^:editor [:slider 1 10]\n(println :saved)");
    buffer.save(&fs, "notes", "scratch.cljs").unwrap();

    let loaded = Buffer::load(&fs, "notes", "scratch.cljs").unwrap();
    assert_eq!(loaded.text(), buffer.text());
    assert_eq!(loaded.regions(), buffer.regions());
    assert!(!loaded.is_dirty());

    let mut driver = driver(fs);
    let result = driver.run(loaded.text()).await;
    assert!(result.is_success(), "{:?}", result);
    assert_eq!(driver.controller().contents(), ":saved");
}

#[tokio::test]
async fn test_resolver_prefers_source_over_script() {
    let fs = MemoryFs::new()
        .with_file("lib/thing.js", "(def kind :script)")
        .with_file("lib/thing.cljc", "(ns lib.thing) (def kind :combined)");
    let resolver = ModuleResolver::new(fs.clone());

    let record = resolver
        .resolve(&ModuleRequest::for_namespace("lib.thing", false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.kind, ModuleKind::Source);
    assert!(record.source.contains(":combined"));

    fs.remove("lib/thing.cljc");
    let record = resolver
        .resolve(&ModuleRequest::for_namespace("lib.thing", false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.kind, ModuleKind::Compiled);

    let missing = resolver
        .resolve(&ModuleRequest::for_namespace("lib.thing", true))
        .await
        .unwrap();
    assert_eq!(missing, None);
}

#[test]
fn test_load_missing_buffer_is_io_error() {
    let fs = MemoryFs::new();
    let err = Buffer::load(&fs, "notes", "missing.cljs").unwrap_err();
    assert!(matches!(err, CompileError::Io(_)));
    assert!(fs.read_file_sync(Path::new("notes/missing.cljs")).is_err());
}
