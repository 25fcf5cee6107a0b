//! Namespace algebra: merging proposal namespaces and checking that granted
//! session namespaces actually cover what a proposal asked for.
//!
//! Everything here is pure; state lives with the caller.

use tacit_store::{ProposalNamespace, ProposalNamespaces, SessionNamespaces};

use crate::error::SignError;

/// Union of required and optional proposal namespaces, keyed per namespace.
///
/// Chains, methods and events are unioned with first-seen order preserved and
/// duplicates dropped. Merging with an empty map returns the other side
/// unchanged.
pub fn merge_namespaces(
    required: &ProposalNamespaces,
    optional: &ProposalNamespaces,
) -> ProposalNamespaces {
    let mut merged = required.clone();
    for (key, namespace) in optional {
        match merged.get_mut(key) {
            Some(existing) => {
                extend_unique(&mut existing.chains, &namespace.chains);
                extend_unique(&mut existing.methods, &namespace.methods);
                extend_unique(&mut existing.events, &namespace.events);
            }
            None => {
                merged.insert(key.clone(), namespace.clone());
            }
        }
    }
    merged
}

fn extend_unique(target: &mut Vec<String>, source: &[String]) {
    for item in source {
        if !target.iter().any(|existing| existing == item) {
            target.push(item.clone());
        }
    }
}

/// Chains a proposal namespace spans: the explicit chain list, or the key
/// itself when the key is already a full chain id.
fn proposal_chains<'a>(key: &'a str, namespace: &'a ProposalNamespace) -> Vec<&'a str> {
    if namespace.chains.is_empty() && key.contains(':') {
        vec![key]
    } else {
        namespace.chains.iter().map(String::as_str).collect()
    }
}

fn is_caip2_chain(chain: &str) -> bool {
    match chain.split_once(':') {
        Some((namespace, reference)) => !namespace.is_empty() && !reference.is_empty(),
        None => false,
    }
}

/// Chain id of a CAIP-10 account, i.e. everything before the final colon.
fn account_chain(account: &str) -> Option<&str> {
    let (chain, address) = account.rsplit_once(':')?;
    if address.is_empty() || !is_caip2_chain(chain) {
        return None;
    }
    Some(chain)
}

/// Structural validation of a proposal namespace map.
pub fn validate_proposal_namespaces(namespaces: &ProposalNamespaces) -> Result<(), SignError> {
    if namespaces.is_empty() {
        return Err(SignError::invalid_namespaces("namespace map is empty"));
    }
    for (key, namespace) in namespaces {
        let chains = proposal_chains(key, namespace);
        if chains.is_empty() {
            return Err(SignError::invalid_namespaces(format!(
                "namespace {key} lists no chains"
            )));
        }
        for chain in chains {
            if !is_caip2_chain(chain) {
                return Err(SignError::invalid_namespaces(format!(
                    "chain '{chain}' in namespace {key} is not a chain id"
                )));
            }
            if !key.contains(':') && chain.split(':').next() != Some(key.as_str()) {
                return Err(SignError::invalid_namespaces(format!(
                    "chain '{chain}' does not belong to namespace {key}"
                )));
            }
        }
    }
    Ok(())
}

/// Structural validation of a granted session namespace map.
pub fn validate_session_namespaces(namespaces: &SessionNamespaces) -> Result<(), SignError> {
    if namespaces.is_empty() {
        return Err(SignError::invalid_namespaces("namespace map is empty"));
    }
    for (key, namespace) in namespaces {
        if namespace.accounts.is_empty() {
            return Err(SignError::invalid_namespaces(format!(
                "namespace {key} grants no accounts"
            )));
        }
        for account in &namespace.accounts {
            let Some(chain) = account_chain(account) else {
                return Err(SignError::invalid_namespaces(format!(
                    "account '{account}' in namespace {key} is not an account id"
                )));
            };
            let in_namespace = if key.contains(':') {
                chain == key
            } else {
                chain.split(':').next() == Some(key.as_str())
            };
            if !in_namespace {
                return Err(SignError::invalid_namespaces(format!(
                    "account '{account}' does not belong to namespace {key}"
                )));
            }
        }
    }
    Ok(())
}

/// Check that the granted session namespaces satisfy everything the required
/// proposal namespaces asked for. Optional namespaces impose nothing.
pub fn ensure_conforms(
    required: &ProposalNamespaces,
    granted: &SessionNamespaces,
) -> Result<(), SignError> {
    validate_session_namespaces(granted)?;
    for (key, requirement) in required {
        let Some(grant) = granted.get(key) else {
            return Err(SignError::invalid_namespaces(format!(
                "required namespace {key} is missing from the grant"
            )));
        };
        let granted_chains: Vec<&str> = grant
            .accounts
            .iter()
            .filter_map(|account| account_chain(account))
            .collect();
        for chain in proposal_chains(key, requirement) {
            if !granted_chains.contains(&chain) {
                return Err(SignError::invalid_namespaces(format!(
                    "required chain {chain} has no granted account"
                )));
            }
        }
        for method in &requirement.methods {
            if !grant.methods.contains(method) {
                return Err(SignError::invalid_namespaces(format!(
                    "required method {method} is not granted"
                )));
            }
        }
        for event in &requirement.events {
            if !grant.events.contains(event) {
                return Err(SignError::invalid_namespaces(format!(
                    "required event {event} is not granted"
                )));
            }
        }
    }
    Ok(())
}

/// True when the session namespaces authorize `method` on `chain`.
pub fn method_authorized(namespaces: &SessionNamespaces, chain: &str, method: &str) -> bool {
    namespaces.iter().any(|(key, namespace)| {
        let chain_in_scope = key == chain
            || namespace.chains.iter().any(|granted| granted == chain)
            || namespace
                .accounts
                .iter()
                .filter_map(|account| account_chain(account))
                .any(|granted| granted == chain);
        chain_in_scope && namespace.methods.iter().any(|granted| granted == method)
    })
}

/// True when the session namespaces authorize emitting `event` on `chain`.
pub fn event_authorized(namespaces: &SessionNamespaces, chain: &str, event: &str) -> bool {
    namespaces.iter().any(|(key, namespace)| {
        let chain_in_scope = key == chain
            || namespace.chains.iter().any(|granted| granted == chain)
            || namespace
                .accounts
                .iter()
                .filter_map(|account| account_chain(account))
                .any(|granted| granted == chain);
        chain_in_scope && namespace.events.iter().any(|granted| granted == event)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tacit_store::SessionNamespace;

    fn proposal_ns(chains: &[&str], methods: &[&str], events: &[&str]) -> ProposalNamespace {
        ProposalNamespace {
            chains: chains.iter().map(|s| (*s).to_owned()).collect(),
            methods: methods.iter().map(|s| (*s).to_owned()).collect(),
            events: events.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    fn session_ns(
        accounts: &[&str],
        methods: &[&str],
        events: &[&str],
    ) -> SessionNamespace {
        SessionNamespace {
            chains: Vec::new(),
            accounts: accounts.iter().map(|s| (*s).to_owned()).collect(),
            methods: methods.iter().map(|s| (*s).to_owned()).collect(),
            events: events.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn merging_with_empty_is_identity() {
        let mut required = ProposalNamespaces::new();
        required.insert(
            "eip155".to_owned(),
            proposal_ns(&["eip155:1"], &["eth_sendTransaction"], &["accountsChanged"]),
        );
        assert_eq!(merge_namespaces(&required, &ProposalNamespaces::new()), required);
        assert_eq!(merge_namespaces(&ProposalNamespaces::new(), &required), required);
    }

    #[test]
    fn merging_unions_and_dedupes() {
        let mut required = ProposalNamespaces::new();
        required.insert(
            "eip155".to_owned(),
            proposal_ns(&["eip155:1"], &["eth_sign"], &["accountsChanged"]),
        );
        let mut optional = ProposalNamespaces::new();
        optional.insert(
            "eip155".to_owned(),
            proposal_ns(&["eip155:1", "eip155:137"], &["eth_sign", "personal_sign"], &[]),
        );
        optional.insert("cosmos".to_owned(), proposal_ns(&["cosmos:cosmoshub-4"], &[], &[]));

        let merged = merge_namespaces(&required, &optional);
        let eip = merged.get("eip155").expect("merged namespace");
        assert_eq!(eip.chains, vec!["eip155:1", "eip155:137"]);
        assert_eq!(eip.methods, vec!["eth_sign", "personal_sign"]);
        assert_eq!(eip.events, vec!["accountsChanged"]);
        assert!(merged.contains_key("cosmos"));
    }

    #[test]
    fn proposal_validation_accepts_chain_keyed_namespaces() {
        let mut namespaces = ProposalNamespaces::new();
        namespaces.insert("eip155:1".to_owned(), proposal_ns(&[], &["eth_sign"], &[]));
        assert!(validate_proposal_namespaces(&namespaces).is_ok());
    }

    #[test]
    fn proposal_validation_rejects_foreign_chains() {
        let mut namespaces = ProposalNamespaces::new();
        namespaces.insert(
            "eip155".to_owned(),
            proposal_ns(&["cosmos:cosmoshub-4"], &["eth_sign"], &[]),
        );
        assert!(validate_proposal_namespaces(&namespaces).is_err());
        assert!(validate_proposal_namespaces(&ProposalNamespaces::new()).is_err());
    }

    #[test]
    fn conformance_requires_every_required_capability() {
        let mut required = ProposalNamespaces::new();
        required.insert(
            "eip155".to_owned(),
            proposal_ns(&["eip155:1"], &["eth_sendTransaction"], &["chainChanged"]),
        );

        let mut granted: SessionNamespaces = BTreeMap::new();
        granted.insert(
            "eip155".to_owned(),
            session_ns(
                &["eip155:1:0xab5801a7d398351b8be11c439e05c5b3259aec9b"],
                &["eth_sendTransaction", "personal_sign"],
                &["chainChanged"],
            ),
        );
        assert!(ensure_conforms(&required, &granted).is_ok());

        let mut missing_method = granted.clone();
        missing_method.get_mut("eip155").expect("namespace").methods =
            vec!["personal_sign".to_owned()];
        assert!(ensure_conforms(&required, &missing_method).is_err());

        let mut missing_chain = granted.clone();
        missing_chain.get_mut("eip155").expect("namespace").accounts =
            vec!["eip155:137:0xab5801a7d398351b8be11c439e05c5b3259aec9b".to_owned()];
        assert!(ensure_conforms(&required, &missing_chain).is_err());

        assert!(ensure_conforms(&required, &BTreeMap::new()).is_err());
    }

    #[test]
    fn session_validation_rejects_accountless_grants() {
        let mut granted: SessionNamespaces = BTreeMap::new();
        granted.insert("eip155".to_owned(), session_ns(&[], &["eth_sign"], &[]));
        assert!(validate_session_namespaces(&granted).is_err());
    }

    #[test]
    fn authorization_checks_chain_and_capability() {
        let mut granted: SessionNamespaces = BTreeMap::new();
        granted.insert(
            "eip155".to_owned(),
            session_ns(
                &["eip155:1:0xab5801a7d398351b8be11c439e05c5b3259aec9b"],
                &["personal_sign"],
                &["accountsChanged"],
            ),
        );
        assert!(method_authorized(&granted, "eip155:1", "personal_sign"));
        assert!(!method_authorized(&granted, "eip155:137", "personal_sign"));
        assert!(!method_authorized(&granted, "eip155:1", "eth_sendTransaction"));
        assert!(event_authorized(&granted, "eip155:1", "accountsChanged"));
        assert!(!event_authorized(&granted, "eip155:1", "chainChanged"));
    }
}
