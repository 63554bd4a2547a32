//! Interface de terminal do reelforge: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{Job, PIPELINE, Stage};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe um spinner com o estágio atual e mensagens coloridas para
/// sucesso (verde) e falha (vermelho).
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    dim: Style,
}

impl JobProgress {
    /// Inicia o spinner com o conceito do job.
    pub fn start(concept: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("pending: {concept}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza a mensagem do spinner para o estágio atual, com a posição no pipeline.
    pub fn update_stage(&self, stage: Stage) {
        let step = stage.ordinal().unwrap_or(0);
        let total = PIPELINE.len() - 1;
        self.pb.set_message(format!("[{step}/{total}] {stage}"));
    }

    /// Registra acima do spinner uma linha para o estágio concluído.
    pub fn stage_done(&self, stage: Stage) {
        self.pb
            .println(format!("  {} {stage}", self.green.apply_to("✓")));
    }

    /// Finaliza o spinner e exibe o resultado final do job.
    pub fn complete(&self, job: &Job) {
        self.pb.finish_and_clear();
        match job.stage {
            Stage::Completed => {
                println!("  {} Job {} completed", self.green.apply_to("✓"), job.id);
                if let Some(video) = &job.video {
                    println!("    video: {}", video.artifact_ref);
                }
                for publication in &job.publications {
                    let link = publication.url.as_deref().unwrap_or(&publication.external_id);
                    println!("    published to {}: {link}", publication.destination);
                }
            }
            _ => {
                let reason = job
                    .error_detail
                    .as_ref()
                    .map(|d| format!("{} at {}: {}", d.kind, d.stage, d.message))
                    .unwrap_or_else(|| format!("stopped at {}", job.stage));
                println!("  {} Job {} failed: {reason}", self.red.apply_to("✗"), job.id);
            }
        }
    }

    /// Interrompe o spinner sem imprimir resultado.
    pub fn abandon(&self, message: &str) {
        self.pb.abandon_with_message(self.dim.apply_to(message).to_string());
    }
}

/// Imprime uma linha por job.
pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    let dim = Style::new().dim();
    for job in jobs {
        println!(
            "{:<36}  {}  {}",
            job.id,
            stage_style(job.stage).apply_to(format!("{:<16}", job.stage)),
            dim.apply_to(&job.concept)
        );
    }
}

/// Imprime o resumo de um job.
pub fn print_job(job: &Job) {
    println!("{} {}", Style::new().bold().apply_to("Job"), job.id);
    println!("  concept: {}", job.concept);
    println!("  model:   {:?}", job.model_choice);
    println!("  stage:   {}", stage_style(job.stage).apply_to(job.stage));
    if let Some(task) = &job.pending_task {
        println!(
            "  waiting: {} (polls: {}, webhook: {})",
            task.provider_task_id, task.poll_attempts, task.webhook
        );
    }
    if let Some(detail) = &job.error_detail {
        println!("  error:   {} at {}: {}", detail.kind, detail.stage, detail.message);
    }
    if let Some(song) = &job.selected_song {
        println!("  song:    {} ({})", song.title, song.audio_url);
    }
    if let Some(image) = &job.image {
        println!("  image:   {}", image.url);
    }
    if let Some(video) = &job.video {
        println!("  video:   {} ({:.1}s)", video.artifact_ref, video.duration_secs);
    }
    for record in &job.stage_history {
        println!("    {}  {}", record.at.format("%Y-%m-%d %H:%M:%S"), record.stage);
    }
}

fn stage_style(stage: Stage) -> Style {
    match stage {
        Stage::Completed => Style::new().green(),
        Stage::Failed => Style::new().red(),
        _ => Style::new().yellow(),
    }
}
