//! Bookmind HTTP server binary

use bookmind::types::{ConceptEdge, ConceptNode};
use bookmind::{
    Bookmind, EngineConfig, HashingEmbedder, HttpCorpusStore, HttpEmbeddingProvider, HttpLlmProvider,
    InMemoryCorpus, LlmProvider, Providers, SourceType,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEMO_DIMENSION: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    println!("Bookmind search & answer engine");
    println!("   Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    let demo = std::env::args().any(|arg| arg == "--demo");
    let port: u16 = std::env::var("BOOKMIND_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8081);
    let mut config = EngineConfig::from_env();

    let providers = if demo {
        println!("Mode: DEMO in-memory library (no network providers)");
        config.models.embedding_model = "hashing".to_string();
        config.models.embedding_dimension = DEMO_DIMENSION;
        Providers {
            store: demo_library(),
            embeddings: Arc::new(HashingEmbedder::new(DEMO_DIMENSION)),
            llm: None,
            shared_cache: None,
        }
    } else {
        let store_url = std::env::var("STORE_SERVICE_URL").unwrap_or_else(|_| "http://127.0.0.1:8090".to_string());
        let embedding_url =
            std::env::var("EMBEDDING_API_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("OPENAI_API_KEY").ok();

        println!("Store service: {}", store_url);
        println!("Embedding API: {} ({})", embedding_url, config.models.embedding_model);

        let store = HttpCorpusStore::new(store_url, Duration::from_millis(config.search.strategy_timeout_ms))?;
        let embeddings = HttpEmbeddingProvider::new(embedding_url, config.models.embedding_model.clone(), api_key.clone());
        let llm: Option<Arc<dyn LlmProvider>> = match std::env::var("LLM_API_URL") {
            Ok(url) => {
                println!("LLM API: {} ({})", url, config.models.generation_model);
                Some(Arc::new(HttpLlmProvider::new(url, config.models.generation_model.clone(), api_key)))
            }
            Err(_) => {
                println!("LLM API: not configured (extractive answers)");
                None
            }
        };
        Providers {
            store: Arc::new(store),
            embeddings: Arc::new(embeddings),
            llm,
            shared_cache: None,
        }
    };

    let engine = Arc::new(Bookmind::new(config, providers));
    println!("Engine initialized");
    println!("Starting HTTP server on port {}...", port);
    println!();

    bookmind::server::run_server(engine, port).await?;

    Ok(())
}

/// A handful of highlights and notes across two languages
fn demo_library() -> Arc<InMemoryCorpus> {
    let corpus = InMemoryCorpus::new();
    let embedder = HashingEmbedder::new(DEMO_DIMENSION);
    let entries = [
        ("walden-12", "walden", "Walden", 12, SourceType::Book,
         "I went to the woods because I wished to live deliberately, to front only the essential facts of life."),
        ("walden-135", "walden", "Walden", 135, SourceType::Highlight,
         "I never found the companion that was so companionable as solitude."),
        ("essays-88", "essays", "Essays", 88, SourceType::Book,
         "We should reserve a back shop all our own, entirely free, in which to establish our real liberty and solitude."),
        ("meditations-4", "meditations", "Meditations", 4, SourceType::Highlight,
         "Nowhere can man find a quieter or more untroubled retreat than in his own soul."),
        ("defter-3", "defter", "Okuma Defteri", 3, SourceType::Note,
         "Bu kitap bilhassa yalnızlık ve sessizlik üzerine düşünmeye davet ediyor."),
        ("defter-7", "defter", "Okuma Defteri", 7, SourceType::Note,
         "Yalnızlık, insanın kendisiyle baş başa kalabilme cesaretidir."),
    ];
    for (id, doc, title, page, source_type, text) in entries {
        let mut chunk = bookmind::in_memory_store::chunk(id, doc, text);
        chunk.document_title = Some(title.to_string());
        chunk.page = Some(page);
        chunk.source_type = source_type;
        corpus.add_chunk(chunk);
        corpus.set_embedding(id, embedder.embed_text(text));
    }

    let concept = |id: &str, label: &str, relevance: f32| ConceptNode {
        id: id.to_string(),
        label: label.to_string(),
        relevance,
    };
    corpus.add_concepts("walden-135", vec![concept("solitude", "Solitude", 0.95)]);
    corpus.add_concepts("essays-88", vec![concept("solitude", "Solitude", 0.8), concept("liberty", "Liberty", 0.7)]);
    corpus.add_concepts("meditations-4", vec![concept("retreat", "Inner retreat", 0.9)]);
    corpus.add_concepts("defter-7", vec![concept("solitude", "Solitude", 0.9)]);
    for (source, target, target_label, relation, weight) in [
        ("solitude", "retreat", "Inner retreat", "related_to", 0.8),
        ("solitude", "liberty", "Liberty", "enables", 0.6),
        ("retreat", "solitude", "Solitude", "related_to", 0.8),
    ] {
        corpus.add_edge(ConceptEdge {
            source_id: source.to_string(),
            target_id: target.to_string(),
            target_label: target_label.to_string(),
            relation: relation.to_string(),
            weight,
        });
    }
    Arc::new(corpus)
}
