/*
 * Copyright (C) 2024 The FCM Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use rand::Rng;

const MAX_OBJECT_NAME_LEN: usize = 63;
const SUFFIX_LEN: usize = 5;
// Same alphabet as Kubernetes generateName: no vowels, no 0, 1 or 3.
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Generates a child object name of the form `<prefix>-<random suffix>`.
///
/// The prefix is truncated so the result stays within the object name limit.
pub fn generate_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    let max_prefix_len = MAX_OBJECT_NAME_LEN.saturating_sub(SUFFIX_LEN + 1);
    let prefix = prefix
        .trim_end_matches('-')
        .chars()
        .take(max_prefix_len)
        .collect::<String>();
    if prefix.is_empty() {
        suffix
    } else {
        format!("{prefix}-{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_keep_prefix_and_limit() {
        let name = generate_name("shoot-firewall");
        assert!(name.starts_with("shoot-firewall-"));
        assert_eq!(name.len(), "shoot-firewall-".len() + SUFFIX_LEN);

        let long = "x".repeat(100);
        assert_eq!(generate_name(&long).len(), MAX_OBJECT_NAME_LEN);
    }

    #[test]
    fn generated_suffixes_use_safe_alphabet() {
        let name = generate_name("fw");
        let suffix = name.strip_prefix("fw-").expect("prefix");
        assert!(suffix.bytes().all(|b| SUFFIX_ALPHABET.contains(&b)));
    }
}
