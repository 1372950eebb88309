use rand::{distributions::Alphanumeric, Rng};

/// A consumer tag unique enough to tell concurrent subscriptions on the same
/// queue apart in broker tooling.
pub fn consumer_tag(queue: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect();

    format!("{queue}.{suffix}")
}
