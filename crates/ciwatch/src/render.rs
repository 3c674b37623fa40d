use chrono::Local;
use ciwatch_client::ViewStatus;
use ciwatch_core::format::{format_date, format_duration, iec_file_size};
use ciwatch_core::reconcile::{CollectionLayout, CollectionView, DashboardView, JobView, RunView};
use ciwatch_core::{Run, ViewState};

/// Plain-text rendering of the current view, one block per update.
pub fn render(status: &ViewStatus, local_now: i64, search: &str) -> String {
    let mut out = Vec::new();
    let route = status
        .route
        .as_ref()
        .map(|route| route.to_string())
        .unwrap_or_else(|| "-".to_string());
    let link = if status.connected { "live" } else { "offline" };
    out.push(format!(
        "== {} {} [{link}] {route}{}",
        title_or_default(&status.title),
        status.version,
        status.query.to_query_string()
    ));

    let server_now = status.clock_skew.server_now(local_now);
    match status.view.as_ref() {
        None => out.push("waiting for server".to_string()),
        Some(ViewState::Dashboard(view)) => dashboard(view, server_now, &mut out),
        Some(ViewState::Collection(view)) => collection(view, search, &mut out),
        Some(ViewState::Job(view)) => job(view, server_now, &mut out),
        Some(ViewState::Run(view)) => run(view, server_now, &mut out),
    }
    out.join("\n")
}

fn title_or_default(title: &str) -> &str {
    if title.is_empty() {
        "Laminar"
    } else {
        title
    }
}

fn run_line(run: &Run, server_now: i64) -> String {
    let pending = if run.started.is_some() {
        "running"
    } else {
        "queued"
    };
    let result = run.result.map(|r| r.as_str()).unwrap_or(pending);
    let mut line = format!("  {} #{} {result}", run.name, run.number);
    if let Some(started) = run.started {
        line.push_str(&format!(
            " ({})",
            format_duration(started, run.completed, server_now)
        ));
    }
    if let Some(progress) = run.progress {
        line.push_str(&format!(" {:.0}%", progress.percent));
        if progress.overtime {
            line.push_str(" overtime");
        }
    }
    line
}

fn dashboard(view: &DashboardView, server_now: i64, out: &mut Vec<String>) {
    let executors = view.charts.utilization;
    out.push(format!(
        "executors {}/{} busy, {} queued",
        executors.busy,
        executors.total,
        view.queued.len()
    ));
    if let Some(today) = view.charts.builds_per_day.last() {
        out.push(format!("today: {} ok, {} failed", today.success, today.failed));
    }
    section("running", &view.running, server_now, out);
    section("queued", &view.queued, server_now, out);
    section("recent", &view.recent, server_now, out);
}

fn collection(view: &CollectionView, search: &str, out: &mut Vec<String>) {
    let jobs = match view.layout {
        CollectionLayout::Wallboard => view.wallboard_jobs(None),
        CollectionLayout::JobList => view.filtered_jobs(search),
    };
    out.push(format!("{} jobs, {} running", jobs.len(), view.running.len()));
    for job in jobs {
        let result = job.result.map(|r| r.as_str()).unwrap_or("-");
        out.push(format!("  {:<32} #{:<6} {result}", job.name, job.number));
    }
}

fn job(view: &JobView, server_now: i64, out: &mut Vec<String>) {
    if !view.description.is_empty() {
        out.push(view.description.clone());
    }
    out.push(format!(
        "{} queued, page {}/{} by {} {}",
        view.n_queued,
        view.sort.page.saturating_add(1),
        view.pages.max(1),
        view.sort.field,
        view.sort.order
    ));
    section("running", &view.running, server_now, out);
    section("recent", &view.recent, server_now, out);
}

fn run(view: &RunView, server_now: i64, out: &mut Vec<String>) {
    let Some(run) = view.run.as_ref() else {
        out.push("waiting for run".to_string());
        return;
    };
    out.push(run_line(run, server_now).trim_start().to_string());
    if let Some(reason) = run.reason.as_deref() {
        out.push(format!("reason: {reason}"));
    }
    if let Some(queued) = run.queued.and_then(|at| format_date(at, &Local)) {
        out.push(format!("queued at {queued}"));
    }
    if let Some(upstream) = run.upstream.as_ref() {
        out.push(format!("triggered by {} #{}", upstream.name, upstream.num));
    }
    if view.has_newer_run() {
        if let Some(latest) = view.latest_num {
            out.push(format!("newer run available: #{latest}"));
        }
    }
    for artifact in &run.artifacts {
        out.push(format!(
            "  artifact {} ({})",
            artifact.filename,
            iec_file_size(artifact.size)
        ));
    }
}

fn section(label: &str, runs: &[Run], server_now: i64, out: &mut Vec<String>) {
    if runs.is_empty() {
        return;
    }
    out.push(format!("{label}:"));
    out.extend(runs.iter().map(|run| run_line(run, server_now)));
}
