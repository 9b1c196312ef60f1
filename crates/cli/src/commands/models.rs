//! `codeloom models`: the model catalog and which models are usable.

use codeloom_core::model::ModelInfo;

use crate::app::App;

pub async fn list(app: &App, check: bool) -> anyhow::Result<()> {
    let adapter = app.orchestrator.adapter();
    let agents = &app.config.agents;
    for model in adapter.catalog().list() {
        let mut roles = Vec::new();
        for (role, id) in [
            ("coder", &agents.coder),
            ("task", &agents.task),
            ("title", &agents.title),
            ("summarizer", &agents.summarizer),
        ] {
            if *id == model.id {
                roles.push(role);
            }
        }
        println!("{}", model_line(&model, adapter.is_available(&model.id), &roles));
    }

    if check {
        let missing = adapter.validate_catalog().await;
        if missing.is_empty() {
            println!("\nAll catalog models are offered by their providers.");
        } else {
            println!("\nNot offered by their provider: {}", missing.join(", "));
        }
    }
    Ok(())
}

fn model_line(model: &ModelInfo, available: bool, roles: &[&str]) -> String {
    let mark = if available { "✓" } else { " " };
    let mut line = format!(
        "{mark} {:<28} {:<10} {:>8} ctx  ${:.2}/${:.2} per 1M",
        model.id, model.provider, model.context_window, model.cost_per_1m_in, model.cost_per_1m_out
    );
    if !roles.is_empty() {
        line.push_str(&format!("  [{}]", roles.join(", ")));
    }
    line
}
