use std::time::Duration;

use super::*;
use crate::test_support::{sample_catalog, ScriptedLlm};
use crate::types::{ClassifyMethod, TaskStatus};

fn new_task() -> Intent {
    Intent::new(IntentKind::NewTask, 0.9, ClassifyMethod::Fallback, "test")
}

fn planner() -> TaskPlanner {
    TaskPlanner::new(sample_catalog())
}

fn fail(graph: &mut TaskGraph, id: &str) {
    let t = graph.get_mut(id).unwrap();
    t.transition(TaskStatus::Running).unwrap();
    t.transition(TaskStatus::Failed).unwrap();
}

fn succeed(graph: &mut TaskGraph, id: &str) {
    let t = graph.get_mut(id).unwrap();
    t.transition(TaskStatus::Running).unwrap();
    t.transition(TaskStatus::Succeeded).unwrap();
}

#[test]
fn test_single_request_single_task() {
    let graph = planner().plan_deterministic("what's the weather in Paris").unwrap();
    assert_eq!(graph.len(), 1);
    let t = graph.get("t1").unwrap();
    assert_eq!(t.tool_candidate.as_deref(), Some("weather"));
    assert_eq!(t.skill.as_deref(), Some("forecast"));
    assert_eq!(t.status, TaskStatus::Ready);
    assert_eq!(t.priority, 1);
}

#[test]
fn test_multi_step_links_outputs_to_inputs() {
    let graph = planner()
        .plan_deterministic("read path=a.txt then summarize it then email it to=bob@x.com")
        .unwrap();
    let ids = graph.ids();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);

    let t1 = graph.get("t1").unwrap();
    let t2 = graph.get("t2").unwrap();
    let t3 = graph.get("t3").unwrap();
    assert_eq!(t1.tool_candidate.as_deref(), Some("read_file"));
    assert_eq!(t2.tool_candidate.as_deref(), Some("summarize"));
    assert_eq!(t3.tool_candidate.as_deref(), Some("send_email"));
    assert!(t2.depends_on.contains("t1"));
    assert_eq!(t3.depends_on.iter().collect::<Vec<_>>(), vec!["t2"]);

    assert_eq!((t1.priority, t2.priority, t3.priority), (3, 2, 1));
    assert_eq!(graph.ready_tasks(), vec!["t1"]);
    assert_eq!(t2.status, TaskStatus::Pending);
}

#[test]
fn test_chinese_sequencing_and_back_reference() {
    let graph = planner().plan_deterministic("读取 path=a.txt 然后总结它").unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.get("t1").unwrap().tool_candidate.as_deref(), Some("read_file"));
    assert_eq!(graph.get("t2").unwrap().tool_candidate.as_deref(), Some("summarize"));
    assert!(graph.get("t2").unwrap().depends_on.contains("t1"));
}

#[test]
fn test_independent_steps_are_both_ready() {
    let graph = planner()
        .plan_deterministic("weather city=Paris; read path=a.txt")
        .unwrap();
    assert_eq!(graph.ready_tasks(), vec!["t1", "t2"]);
    assert!(graph.tasks().all(|t| t.depends_on.is_empty()));
}

#[test]
fn test_critical_path_runs_first() {
    let graph = TaskGraph::from_tasks(vec![
        Task::new("a", "lone"),
        Task::new("b", "head"),
        Task::new("c", "middle").with_dependency("b"),
        Task::new("d", "tail").with_dependency("c"),
    ])
    .unwrap();
    assert_eq!(graph.get("b").unwrap().priority, 3);
    assert_eq!(graph.get("a").unwrap().priority, 1);
    assert_eq!(graph.ready_tasks(), vec!["b", "a"]);
}

#[test]
fn test_cycles_and_bad_edges_rejected() {
    let err = TaskGraph::from_tasks(vec![
        Task::new("t1", "x").with_dependency("t2"),
        Task::new("t2", "y").with_dependency("t1"),
        Task::new("t3", "z"),
    ])
    .unwrap_err();
    match err {
        PipelineError::CyclicDependency(ids) => assert_eq!(ids, vec!["t1", "t2"]),
        other => panic!("unexpected {other:?}"),
    }

    assert!(matches!(
        TaskGraph::from_tasks(vec![Task::new("t1", "x").with_dependency("t1")]),
        Err(PipelineError::CyclicDependency(_))
    ));
    assert!(matches!(
        TaskGraph::from_tasks(vec![Task::new("t1", "x").with_dependency("ghost")]),
        Err(PipelineError::UnknownDependency { .. })
    ));
    assert!(matches!(
        TaskGraph::from_tasks(vec![Task::new("t1", "x"), Task::new("t1", "y")]),
        Err(PipelineError::DuplicateTask(_))
    ));
}

#[test]
fn test_infeasible_plans() {
    let p = planner();
    assert!(matches!(
        p.plan_deterministic("dance a jig"),
        Err(PipelineError::PlanInfeasible(_))
    ));
    assert!(matches!(
        p.plan_deterministic("  ;  "),
        Err(PipelineError::PlanInfeasible(_))
    ));
    let small = planner().with_max_tasks(2);
    assert!(matches!(
        small.plan_deterministic("read path=a then summarize it then email it"),
        Err(PipelineError::PlanInfeasible(_))
    ));
}

#[tokio::test]
async fn test_goal_selection_by_intent() {
    let p = planner();
    let cancel = CancellationToken::new();
    let state = ConversationState::new("c1", "继续");

    let cont = Intent::new(IntentKind::ContinueExecution, 0.98, ClassifyMethod::Rule, "exact");
    assert!(matches!(
        p.plan(&cont, "继续", &state, &cancel).await,
        Err(PipelineError::PlanInfeasible(_))
    ));
    let with_goal = state.clone().with_goal("weather city=Paris");
    let graph = p.plan(&cont, "继续", &with_goal, &cancel).await.unwrap();
    assert_eq!(graph.get("t1").unwrap().description, "weather city=Paris");

    let cancel_intent = Intent::new(IntentKind::CancelTask, 0.98, ClassifyMethod::Rule, "exact");
    assert!(p.plan(&cancel_intent, "算了", &with_goal, &cancel).await.is_err());

    let modify = Intent::new(IntentKind::ModifyRequirement, 0.8, ClassifyMethod::Keyword, "改");
    let graph = p
        .plan(&modify, "改成 city=London", &with_goal, &cancel)
        .await
        .unwrap();
    assert_eq!(graph.get("t1").unwrap().description, "weather city=London");
}

#[test]
fn test_apply_overrides() {
    assert_eq!(
        apply_overrides("send to=a@x.com body=hi", "no, to=b@x.com"),
        "send to=b@x.com body=hi"
    );
    assert_eq!(apply_overrides("weather", "units=imperial"), "weather units=imperial");
    assert_eq!(
        apply_overrides("weather city=Paris", " 改成查询伦敦的天气 "),
        "改成查询伦敦的天气"
    );
}

#[test]
fn test_split_subgoals() {
    assert_eq!(
        split_subgoals("先读取文件，然后总结；最后发邮件"),
        vec!["读取文件", "总结", "发邮件"]
    );
    assert_eq!(split_subgoals("read it and then send it"), vec!["read it", "send it"]);
    assert_eq!(split_subgoals("authentic weather"), vec!["authentic weather"]);
}

#[tokio::test]
async fn test_llm_decomposition() {
    let llm = ScriptedLlm::new(&[r#"```json
[{"id": 1, "description": "read path=a.txt", "tool": "read_file"},
 {"id": 2, "description": "summarize the text", "tool": "summarize", "depends_on": [1]}]
```"#]);
    let p = planner().with_llm(llm.clone(), Duration::from_secs(1));
    let state = ConversationState::new("c1", "summarize a.txt");
    let graph = p
        .plan(&new_task(), "summarize a.txt", &state, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(llm.calls(), 1);
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.get("t1").unwrap().skill.as_deref(), Some("files"));
    assert!(graph.get("t2").unwrap().depends_on.contains("t1"));
}

#[tokio::test]
async fn test_invalid_llm_plans_fall_back() {
    let answers = [
        "I would read the file first.",
        r#"[{"id":"a","description":"read x","tool":"read_file","depends_on":["b"]},
            {"id":"b","description":"summarize","tool":"summarize","depends_on":["a"]}]"#,
        r#"[{"id":"a","description":"teleport","tool":"teleport"}]"#,
        "[]",
    ];
    for answer in answers {
        let p = planner().with_llm(ScriptedLlm::new(&[answer]), Duration::from_secs(1));
        let state = ConversationState::new("c1", "read path=a.txt");
        let graph = p
            .plan(&new_task(), "read path=a.txt", &state, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(graph.len(), 1, "answer: {answer}");
        assert_eq!(graph.get("t1").unwrap().tool_candidate.as_deref(), Some("read_file"));
    }
}

#[tokio::test]
async fn test_llm_planning_can_be_disabled() {
    let llm = ScriptedLlm::new(&["[]"]);
    let p = planner()
        .with_llm(llm.clone(), Duration::from_secs(1))
        .with_llm_planning(false);
    let state = ConversationState::new("c1", "read path=a.txt");
    p.plan(&new_task(), "read path=a.txt", &state, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(llm.calls(), 0);
}

#[test]
fn test_failure_skips_dependents_not_siblings() {
    let mut graph = TaskGraph::from_tasks(vec![
        Task::new("t1", "a"),
        Task::new("t2", "b").with_dependency("t1"),
        Task::new("t3", "c").with_dependency("t2"),
        Task::new("t4", "sibling"),
    ])
    .unwrap();
    fail(&mut graph, "t1");
    let skipped = graph.propagate_failure("t1");
    assert_eq!(skipped.len(), 2);
    assert_eq!(graph.get("t2").unwrap().status, TaskStatus::Skipped);
    assert_eq!(graph.get("t3").unwrap().status, TaskStatus::Skipped);
    assert_eq!(graph.get("t4").unwrap().status, TaskStatus::Ready);
    assert!(!graph.is_complete());
}

#[test]
fn test_succeeded_tasks_rerun_only_when_stale() {
    let mut graph = TaskGraph::from_tasks(vec![
        Task::new("t1", "a"),
        Task::new("t2", "b").with_dependency("t1"),
    ])
    .unwrap();
    succeed(&mut graph, "t1");
    assert_eq!(graph.promote_ready(), vec!["t2"]);
    assert!(!graph.ready_tasks().contains(&"t1".to_string()));

    graph.mark_stale("t1").unwrap();
    let t1 = graph.get("t1").unwrap();
    assert!(t1.stale);
    assert_eq!(t1.status, TaskStatus::Ready);
    assert_eq!(graph.get("t2").unwrap().status, TaskStatus::Pending);

    assert!(graph.mark_stale("t2").is_err());
    assert!(matches!(graph.mark_stale("nope"), Err(PipelineError::UnknownTask(_))));
}

#[test]
fn test_add_task_validates() {
    let mut graph = TaskGraph::from_tasks(vec![Task::new("t1", "a")]).unwrap();
    graph.add_task(Task::new("t2", "b").with_dependency("t1")).unwrap();
    assert_eq!(graph.get("t1").unwrap().priority, 2);
    assert!(graph.add_task(Task::new("t2", "dup")).is_err());
    assert!(graph.add_task(Task::new("t3", "c").with_dependency("t9")).is_err());
}

#[test]
fn test_replan_uses_next_untried_tool() {
    let p = planner();
    let mut graph = p
        .plan_deterministic("weather city=Paris then email it to=bob@x.com")
        .unwrap();
    assert_eq!(graph.get("t1").unwrap().tool_candidate.as_deref(), Some("weather"));
    assert!(graph.get("t2").unwrap().depends_on.contains("t1"));

    fail(&mut graph, "t1");
    let replacement = p.replan(&mut graph, "t1").unwrap();
    assert_eq!(replacement.as_deref(), Some("t1-r1"));
    let r = graph.get("t1-r1").unwrap();
    assert_eq!(r.tool_candidate.as_deref(), Some("weather_backup"));
    assert_eq!(r.status, TaskStatus::Ready);
    assert_eq!(graph.get("t1").unwrap().replaced_by.as_deref(), Some("t1-r1"));
    assert!(graph.get("t2").unwrap().depends_on.contains("t1-r1"));
    assert!(!graph.get("t2").unwrap().depends_on.contains("t1"));

    fail(&mut graph, "t1-r1");
    assert_eq!(p.replan(&mut graph, "t1-r1").unwrap(), None);
}

#[test]
fn test_replace_requires_failed_task() {
    let mut graph = TaskGraph::from_tasks(vec![Task::new("t1", "a")]).unwrap();
    assert!(graph.replace_task("t1", Task::new("t1-r1", "a")).is_err());
    assert!(graph.get("t1-r1").is_none());
}
