use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::{Value, json};

/// Generate n random parameter sets for the support prompt.
pub fn generate_random_parameters(n: usize) -> Vec<Value> {
    let mut rng = StdRng::seed_from_u64(42); // Fixed seed for reproducibility
    let mut parameters = Vec::with_capacity(n);

    for _ in 0..n {
        let turns = rng.random_range(2..8);
        let history: Vec<Value> = (0..turns)
            .map(|i| {
                json!({
                    "role": if i % 2 == 0 { "user" } else { "assistant" },
                    "text": random_sentence(&mut rng, 4, 12),
                })
            })
            .collect();

        let document_count = rng.random_range(0..5);
        let documents: Vec<Value> = (0..document_count)
            .map(|_| {
                json!({
                    "title": random_word(&mut rng, 4, 10),
                    "body": random_sentence(&mut rng, 10, 30),
                    "pinned": rng.random_bool(0.3),
                })
            })
            .collect();

        parameters.push(json!({
            "company": random_word(&mut rng, 4, 8),
            "user": { "name": random_word(&mut rng, 3, 8), "premium": rng.random_bool(0.4) },
            "history": history,
            "documents": documents,
            "question": random_sentence(&mut rng, 5, 15),
            "screenshot": if rng.random_bool(0.5) { json!("https://example.com/shot.png") } else { Value::Null },
            "order_id": rng.random_range(1000..9999),
        }));
    }

    parameters
}

fn random_sentence(rng: &mut StdRng, min_words: usize, max_words: usize) -> String {
    let words = rng.random_range(min_words..=max_words);
    (0..words)
        .map(|_| random_word(rng, 2, 9))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Generate a random lowercase word with length between min and max
fn random_word(rng: &mut StdRng, min_len: usize, max_len: usize) -> String {
    let charset = b"abcdefghijklmnopqrstuvwxyz";
    let len = rng.random_range(min_len..=max_len);

    (0..len)
        .map(|_| char::from(charset[rng.random_range(0..charset.len())]))
        .collect()
}
