use std::path::{Path, PathBuf};

use dialoguer::{Confirm, Input, Password, Select};
use mnemo_core::config::{
    Config, EmbeddingConfig, EmbeddingProviderKind, MemoryConfig, SearchConfig,
};

#[derive(Default)]
#[cfg_attr(test, derive(Clone))]
pub(crate) struct WizardState {
    pub(crate) data_dir: Option<PathBuf>,
    pub(crate) provider: Option<EmbeddingProviderKind>,
    pub(crate) base_url: Option<String>,
    pub(crate) model: Option<String>,
    pub(crate) api_key: Option<String>,
    pub(crate) default_k: Option<usize>,
    pub(crate) default_tag_limit: Option<usize>,
}

/// Interactive wizard that writes a `mnemo.toml`.
///
/// # Errors
///
/// Returns an error if a prompt fails or the file cannot be written.
pub fn run(output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("mnemo init - configuration wizard\n");

    let mut state = WizardState::default();
    step_memory(&mut state)?;
    step_embedding(&mut state)?;
    step_search(&mut state)?;
    step_review_and_write(&state, output)?;

    Ok(())
}

fn step_memory(state: &mut WizardState) -> anyhow::Result<()> {
    println!("== Step 1/4: Storage ==\n");

    let data_dir: String = Input::new()
        .with_prompt("Data directory (index and catalogue live here)")
        .default("./data".into())
        .interact_text()?;
    state.data_dir = Some(PathBuf::from(data_dir));

    println!();
    Ok(())
}

fn step_embedding(state: &mut WizardState) -> anyhow::Result<()> {
    println!("== Step 2/4: Embedding Provider ==\n");

    let providers = ["Ollama (local)", "Compatible (OpenAI-style /embeddings)"];
    let sel = Select::new()
        .with_prompt("Embedding provider")
        .items(providers)
        .default(0)
        .interact()?;

    if sel == 0 {
        state.provider = Some(EmbeddingProviderKind::Ollama);
        state.base_url = Some(
            Input::new()
                .with_prompt("Ollama base URL")
                .default("http://localhost:11434".into())
                .interact_text()?,
        );
    } else {
        state.provider = Some(EmbeddingProviderKind::Compatible);
        state.base_url = Some(
            Input::new()
                .with_prompt("Base URL")
                .default("https://api.openai.com/v1".into())
                .interact_text()?,
        );
        let raw = Password::new()
            .with_prompt("API key (leave empty if none)")
            .allow_empty_password(true)
            .interact()?;
        state.api_key = if raw.is_empty() { None } else { Some(raw) };
    }

    state.model = Some(
        Input::new()
            .with_prompt("Embedding model")
            .default("all-minilm".into())
            .interact_text()?,
    );

    println!();
    Ok(())
}

fn step_search(state: &mut WizardState) -> anyhow::Result<()> {
    println!("== Step 3/4: Search Defaults ==\n");

    state.default_k = Some(
        Input::new()
            .with_prompt("Results per semantic search")
            .default(5usize)
            .interact_text()?,
    );
    state.default_tag_limit = Some(
        Input::new()
            .with_prompt("Results per tag search")
            .default(20usize)
            .interact_text()?,
    );

    println!();
    Ok(())
}

pub(crate) fn build_config(state: &WizardState) -> Config {
    let memory = MemoryConfig {
        data_dir: state
            .data_dir
            .clone()
            .unwrap_or_else(|| MemoryConfig::default().data_dir),
        ..MemoryConfig::default()
    };

    let defaults = EmbeddingConfig::default();
    let embedding = EmbeddingConfig {
        provider: state.provider.unwrap_or(defaults.provider),
        base_url: state.base_url.clone().unwrap_or(defaults.base_url),
        model: state.model.clone().unwrap_or(defaults.model),
        api_key: state.api_key.clone(),
    };

    let defaults = SearchConfig::default();
    let search = SearchConfig {
        default_k: state.default_k.unwrap_or(defaults.default_k),
        default_tag_limit: state.default_tag_limit.unwrap_or(defaults.default_tag_limit),
        default_history_limit: defaults.default_history_limit,
    };

    Config {
        memory,
        embedding,
        search,
    }
}

fn step_review_and_write(state: &WizardState, output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("== Step 4/4: Review & Write ==\n");

    let config = build_config(state);
    config.validate()?;
    let toml_str = toml::to_string_pretty(&config)?;

    println!("--- Generated config ---");
    println!("{toml_str}");
    println!("------------------------\n");

    let default_path = PathBuf::from("mnemo.toml");
    let path = output.unwrap_or_else(|| {
        Input::new()
            .with_prompt("Write config to")
            .default(default_path.display().to_string())
            .interact_text()
            .map(PathBuf::from)
            .unwrap_or(default_path)
    });

    if path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", path.display()))
            .default(false)
            .interact()?;
        if !overwrite {
            println!("Aborted.");
            return Ok(());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &toml_str)?;
    println!("Config written to {}", path.display());

    print_secrets_instructions(state);
    print_next_steps(&path);

    Ok(())
}

/// Env vars the user must export because the config file never stores them.
fn required_secrets(state: &WizardState) -> Vec<&'static str> {
    if state.api_key.is_some() {
        vec!["MNEMO_EMBED_API_KEY"]
    } else {
        Vec::new()
    }
}

fn print_secrets_instructions(state: &WizardState) {
    let secrets = required_secrets(state);
    if secrets.is_empty() {
        return;
    }
    println!("\nAPI keys are not written to the config file.");
    println!("Add the following to your shell profile:");
    for var in secrets {
        println!("  export {var}=\"<your-secret>\"");
    }
}

fn print_next_steps(path: &Path) {
    println!("\nNext steps:");
    println!("  1. Set required environment variables (see above)");
    println!(
        "  2. Run: mnemo --config {} add --conversation c1 \"first memory\"",
        path.display()
    );
    println!("  3. Then: mnemo --config {} search \"memory\"", path.display());
}
