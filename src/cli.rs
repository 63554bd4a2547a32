//! Interface de linha de comando do reelforge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, run, submit, status, publish)
//! e flags globais (--config, --model, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::state_machine::ModelChoice;

/// reelforge: orquestrador de pipeline que transforma um conceito em um vídeo musical.
#[derive(Debug, Parser)]
#[command(name = "reelforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./reelforge.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Nível de modelo usado na análise do conceito.
    #[arg(long, global = true)]
    pub model: Option<ModelArg>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Argumento de modelo aceito pela CLI, mapeado para [`ModelChoice`] internamente.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModelArg {
    /// Modelo rápido e econômico.
    Fast,
    /// Modelo equilibrado (padrão).
    Balanced,
    /// Modelo mais capaz.
    Best,
}

impl From<ModelArg> for ModelChoice {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Fast => ModelChoice::Fast,
            ModelArg::Balanced => ModelChoice::Balanced,
            ModelArg::Best => ModelChoice::Best,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sobe os workers, o receptor de webhooks e a varredura de recuperação.
    Serve,

    /// Cria um job e acompanha sua execução neste processo até o fim.
    Run {
        /// Conceito do vídeo.
        concept: String,

        /// Dono do job.
        #[arg(long, default_value = "cli")]
        owner: String,
    },

    /// Persiste um job novo para ser executado por um `serve` em andamento.
    Submit {
        /// Conceito do vídeo.
        concept: String,

        #[arg(long, default_value = "cli")]
        owner: String,
    },

    /// Mostra o status de um job, ou de todos quando nenhum id é dado.
    Status {
        job_id: Option<String>,

        /// Imprime o job completo em JSON.
        #[arg(long)]
        json: bool,
    },

    /// Publica novamente o vídeo de um job concluído.
    Publish { job_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["reelforge", "run", "rainy neon city"]);
        match cli.command {
            Command::Run { concept, owner } => {
                assert_eq!(concept, "rainy neon city");
                assert_eq!(owner, "cli");
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "reelforge",
            "--model",
            "best",
            "--config",
            "/etc/reelforge.toml",
            "--verbose",
            "serve",
        ]);
        assert!(cli.verbose);
        assert!(matches!(cli.model, Some(ModelArg::Best)));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/reelforge.toml")));
        assert!(matches!(cli.command, Command::Serve));
    }

    #[test]
    fn cli_parses_status_subcommand() {
        let cli = Cli::parse_from(["reelforge", "status", "job-1", "--json"]);
        match cli.command {
            Command::Status { job_id, json } => {
                assert_eq!(job_id.as_deref(), Some("job-1"));
                assert!(json);
            }
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn model_arg_maps_to_choice() {
        assert_eq!(ModelChoice::from(ModelArg::Fast), ModelChoice::Fast);
        assert_eq!(ModelChoice::from(ModelArg::Best), ModelChoice::Best);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
