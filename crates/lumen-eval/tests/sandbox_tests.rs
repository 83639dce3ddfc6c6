/// Integration tests for the sandboxed runtime

use lumen_eval::{Error, OutputSink, RuntimeOptions, RuntimeState, Sandbox, Value};

fn sandbox() -> (Sandbox, OutputSink) {
    let output = OutputSink::new();
    (Sandbox::new(output.clone(), RuntimeOptions::default()), output)
}

async fn eval(source: &str) -> Result<Value, Error> {
    let (mut sandbox, _) = sandbox();
    sandbox.eval_str(source, "user").await
}

fn nums(ns: &[f64]) -> Value {
    Value::vector(ns.iter().map(|n| Value::Number(*n)).collect())
}

#[tokio::test]
async fn test_output_in_execution_order() {
    let (mut sandbox, output) = sandbox();
    sandbox
        .eval_str(r#"(println "a") (prn "b" :c) (print 1 [2 3]) (str "not printed")"#, "user")
        .await
        .unwrap();

    assert_eq!(output.contents(), "a\n\"b\" :c\n1 [2 3]");
}

#[tokio::test]
async fn test_prelude_sequence_functions() {
    assert_eq!(eval("(reduce + (map inc [1 2 3]))").await.unwrap(), Value::Number(9.0));
    assert_eq!(eval("(mapv (fn* [x] (* x x)) (range 4))").await.unwrap(), nums(&[0.0, 1.0, 4.0, 9.0]));
    assert_eq!(eval("(vec (filter even? (range 7)))").await.unwrap(), nums(&[0.0, 2.0, 4.0, 6.0]));
    assert_eq!(eval("(into [] (take 2 (drop 1 [1 2 3 4])))").await.unwrap(), nums(&[2.0, 3.0]));
    assert_eq!(eval("((comp inc inc) 1)").await.unwrap(), Value::Number(3.0));
    assert_eq!(eval("((partial + 1 2) 3)").await.unwrap(), Value::Number(6.0));
    assert_eq!(eval("(some (fn* [x] (if (> x 2) x nil)) [1 2 3 4])").await.unwrap(), Value::Number(3.0));
    assert_eq!(eval("(last (reverse [1 2 3]))").await.unwrap(), Value::Number(1.0));
}

#[tokio::test]
async fn test_functions_and_arities() {
    let source = r#"
(def f (fn* ([] 0) ([a] a) ([a & more] (+ a (count more)))))
[(f) (f 5) (f 5 1 1)]
"#;
    assert_eq!(eval(source).await.unwrap(), nums(&[0.0, 5.0, 7.0]));

    let fact = "((fn* fact [n] (if (< n 2) 1 (* n (fact (dec n))))) 5)";
    assert_eq!(eval(fact).await.unwrap(), Value::Number(120.0));

    let err = eval("((fn* [a b] a) 1)").await.unwrap_err();
    assert!(matches!(&err, Error::Runtime(msg) if msg.starts_with("Wrong number of args (1) passed to")), "{}", err);
}

#[tokio::test]
async fn test_loop_and_recur() {
    let sum = "(loop* [i 0 acc 0] (if (< i 100000) (recur (inc i) (+ acc i)) acc))";
    assert_eq!(eval(sum).await.unwrap(), Value::Number(4999950000.0));

    let count_down = "((fn* [n & _] (if (> n 0) (recur (dec n) nil) :done)) 10)";
    assert_eq!(eval(count_down).await.unwrap(), Value::keyword("done"));

    assert!(matches!(eval("(loop* [i 0] (inc (recur i)))").await, Err(Error::Syntax(_))));
}

#[tokio::test]
async fn test_try_catch_finally() {
    let caught = r#"(try (throw (ex-info "boom" {:code 7})) (catch :default e [(ex-message e) (:code (ex-data e))]))"#;
    assert_eq!(
        eval(caught).await.unwrap(),
        Value::vector(vec![Value::string("boom"), Value::Number(7.0)])
    );

    let native = r#"(try (+ 1 nil) (catch :default e (ex-message e)))"#;
    assert_eq!(eval(native).await.unwrap(), Value::string("+ expects a number, got nil"));

    let (mut sandbox, output) = sandbox();
    let err = sandbox
        .eval_str(
            r#"(try (println "body") (throw "raw") (finally (println "cleanup")))"#,
            "user",
        )
        .await
        .unwrap_err();
    assert_eq!(err, Error::Exception("\"raw\"".into()));
    assert_eq!(output.lines(), vec!["body".to_string(), "cleanup".to_string()]);
    assert_eq!(sandbox.state(), RuntimeState::Errored);
}

#[tokio::test]
async fn test_uncaught_native_error_is_runtime() {
    let err = eval("(nth [1 2] 5)").await.unwrap_err();
    assert_eq!(err, Error::Runtime("Index 5 out of bounds".into()));

    let err = eval("(undefined-thing 1)").await.unwrap_err();
    assert_eq!(err.to_string(), "Unable to resolve symbol: undefined-thing");
}

#[tokio::test]
async fn test_call_depth_is_bounded() {
    let output = OutputSink::new();
    let mut sandbox = Sandbox::new(output, RuntimeOptions::new().max_stack_depth(50));
    let source = "(def down (fn* down [n] (if (= n 0) 0 (+ 1 (down (dec n)))))) (down 100)";
    let err = sandbox.eval_str(source, "user").await.unwrap_err();
    assert_eq!(err, Error::Runtime("Maximum call stack size exceeded".into()));

    // Deep but bounded recursion stays off the host stack.
    let source = "(def down (fn* down [n] (if (= n 0) 0 (+ 1 (down (dec n)))))) (down 5000)";
    assert_eq!(eval(source).await.unwrap(), Value::Number(5000.0));
}

#[tokio::test]
async fn test_atoms_apply_and_callable_collections() {
    let source = "(def a (atom 0)) (swap! a + 5) (swap! a inc) @a";
    assert_eq!(eval(source).await.unwrap(), Value::Number(6.0));

    assert_eq!(eval("(apply + 1 [2 3])").await.unwrap(), Value::Number(6.0));
    assert_eq!(eval("(:a {:a 1})").await.unwrap(), Value::Number(1.0));
    assert_eq!(eval("(:b {:a 1} 2)").await.unwrap(), Value::Number(2.0));
    assert_eq!(eval("(#{:x} :x)").await.unwrap(), Value::keyword("x"));
    assert_eq!(eval("([10 20] 1)").await.unwrap(), Value::Number(20.0));
}

#[tokio::test]
async fn test_namespaces_and_aliases() {
    let source = r#"
(ns* app.util {} {})
(def helper (fn* [x] (* x 2)))
(ns* app.main {u app.util} {helper app.util})
[(u/helper 21) (helper 1)]
"#;
    assert_eq!(eval(source).await.unwrap(), nums(&[42.0, 2.0]));
}

#[tokio::test]
async fn test_host_bridge() {
    let source = r#"
(lumen.host/provide "widgets" {:slider 1})
(:slider (lumen.host/require "widgets"))
"#;
    assert_eq!(eval(source).await.unwrap(), Value::Number(1.0));

    let missing = r#"(try (lumen.host/require "nope") (catch :default e (ex-message e)))"#;
    assert_eq!(
        eval(missing).await.unwrap(),
        Value::string("Namespace nope has not been provided")
    );
}

#[tokio::test]
async fn test_infinite_loop_halts_within_bounded_checkpoints() {
    let output = OutputSink::new();
    let mut sandbox = Sandbox::new(output.clone(), RuntimeOptions::new().yield_interval(10));
    let handle = sandbox.halt_handle();

    let run = sandbox.eval_str("(loop* [i 0] (println i) (recur (inc i)))", "user");
    let halter = async {
        while output.len() < 5 {
            tokio::task::yield_now().await;
        }
        handle.halt();
        output.len()
    };
    let (result, printed_at_halt) = tokio::join!(run, halter);

    assert_eq!(result.unwrap_err(), Error::Halted);
    assert_eq!(sandbox.state(), RuntimeState::Halted);
    // Nothing runs between the halt request and the checkpoint that observes it.
    assert_eq!(output.len(), printed_at_halt);
    assert!(sandbox.checkpoints() < 100, "took {} checkpoints", sandbox.checkpoints());

    let err = sandbox.eval_str("1", "user").await.unwrap_err();
    assert_eq!(err, Error::Terminated(RuntimeState::Halted));
}

#[tokio::test]
async fn test_halt_handle_reports_settled_state() {
    let (mut sandbox, _) = sandbox();
    let mut handle = sandbox.halt_handle();

    sandbox.eval_str("(+ 1 1)", "user").await.unwrap();
    sandbox.complete();
    assert_eq!(handle.wait_settled().await, RuntimeState::Completed);
}

#[tokio::test]
async fn test_wait_settled_after_sandbox_dropped() {
    let (sandbox, _) = sandbox();
    let mut handle = sandbox.halt_handle();
    drop(sandbox);
    assert_eq!(handle.wait_settled().await, RuntimeState::Idle);
}

#[tokio::test]
async fn test_large_sequences() {
    let sum = "(reduce + (map inc (range 100000)))";
    assert_eq!(eval(sum).await.unwrap(), Value::Number(5000050000.0));

    let evens = "(count (filter even? (into [] (range 100000))))";
    assert_eq!(eval(evens).await.unwrap(), Value::Number(50000.0));

    let last = "(loop* [xs (range 100000) n 0] (if (next xs) (recur (rest xs) (inc n)) [n (first xs)]))";
    assert_eq!(eval(last).await.unwrap(), nums(&[99999.0, 99999.0]));
}

#[tokio::test]
async fn test_range_is_bounded() {
    let err = eval("(range ##Inf)").await.unwrap_err();
    assert_eq!(err, Error::Runtime("range bounds must be finite".into()));

    let err = eval("(range 1e12)").await.unwrap_err();
    assert!(matches!(&err, Error::Runtime(msg) if msg.contains("exceeds the limit")), "{}", err);

    assert_eq!(eval("(count (range 1e16 (+ 1e16 10)))").await.unwrap(), Value::Number(10.0));
}

#[tokio::test]
async fn test_deeply_nested_data() {
    let source = "(loop* [x [] y [] i 0] (if (< i 100000) (recur [x] (list y) (inc i)) (= x y)))";
    assert_eq!(eval(source).await.unwrap(), Value::Bool(true));

    let source = "(def a (atom nil)) (reset! a [1 a]) (pr-str a)";
    assert_eq!(eval(source).await.unwrap(), Value::string("#<atom [1 #<atom>]>"));
}
