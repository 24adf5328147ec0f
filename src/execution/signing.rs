use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::keccak256;
use serde_json::{json, Value};

use super::wire::Action;
use crate::error::{Error, Result};

const DOMAIN_NAME: &str = "Exchange";
const DOMAIN_VERSION: &str = "1";
const DOMAIN_CHAIN_ID: u64 = 1337;

const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const AGENT_TYPE: &str = "Agent(string source,bytes32 connectionId)";

/// Signs exchange actions with an account's secret key
///
/// Actions are msgpack-encoded, hashed together with the nonce and optional
/// vault address, and the hash is signed as an EIP-712 `Agent` message.
#[derive(Clone)]
pub struct ActionSigner {
    wallet: LocalWallet,
    is_mainnet: bool,
    vault_address: Option<Address>,
}

impl std::fmt::Debug for ActionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSigner")
            .field("address", &self.wallet.address())
            .field("is_mainnet", &self.is_mainnet)
            .finish()
    }
}

impl ActionSigner {
    /// # Errors
    /// `MissingCredentials` when the key is empty or not a valid secp256k1 key.
    pub fn from_secret_key(secret_key: &str, is_mainnet: bool) -> Result<Self> {
        let secret_key = secret_key.trim();
        if secret_key.is_empty() {
            return Err(Error::MissingCredentials("empty secret key".into()));
        }

        let wallet = secret_key
            .parse::<LocalWallet>()
            .map_err(|e| Error::MissingCredentials(format!("invalid secret key: {}", e)))?;

        Ok(Self {
            wallet,
            is_mainnet,
            vault_address: None,
        })
    }

    pub fn with_vault_address(mut self, vault: Address) -> Self {
        self.vault_address = Some(vault);
        self
    }

    /// Address of the signing key (may be an API wallet acting for the account)
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn sign(&self, action: &Action, nonce: u64) -> Result<Signature> {
        let connection_id = action_hash(action, nonce, self.vault_address)?;
        let digest = agent_digest(connection_id, self.is_mainnet);

        self.wallet
            .sign_hash(digest)
            .map_err(|e| Error::MissingCredentials(format!("signing failed: {}", e)))
    }

    /// Full `action` post payload: action, nonce, signature, vault
    pub fn signed_payload(&self, action: &Action, nonce: u64) -> Result<Value> {
        let signature = self.sign(action, nonce)?;

        Ok(json!({
            "action": serde_json::to_value(action)?,
            "nonce": nonce,
            "signature": signature_to_json(&signature),
            "vaultAddress": self.vault_address.map(|v| format!("{:?}", v)),
        }))
    }
}

/// keccak(msgpack(action) ‖ nonce as u64 BE ‖ vault flag [‖ vault address])
pub fn action_hash(action: &Action, nonce: u64, vault_address: Option<Address>) -> Result<H256> {
    let mut bytes = rmp_serde::to_vec_named(action)
        .map_err(|e| Error::Parse(format!("msgpack encoding failed: {}", e)))?;

    bytes.extend_from_slice(&nonce.to_be_bytes());
    match vault_address {
        Some(vault) => {
            bytes.push(1);
            bytes.extend_from_slice(vault.as_bytes());
        }
        None => bytes.push(0),
    }

    Ok(H256::from(keccak256(bytes)))
}

/// EIP-712 digest of `Agent { source, connectionId }` under the exchange domain
pub fn agent_digest(connection_id: H256, is_mainnet: bool) -> H256 {
    let source = if is_mainnet { "a" } else { "b" };

    let mut domain = Vec::with_capacity(32 * 5);
    domain.extend_from_slice(&keccak256(DOMAIN_TYPE));
    domain.extend_from_slice(&keccak256(DOMAIN_NAME));
    domain.extend_from_slice(&keccak256(DOMAIN_VERSION));
    domain.extend_from_slice(&u256_bytes(U256::from(DOMAIN_CHAIN_ID)));
    // verifyingContract is the zero address
    domain.extend_from_slice(&[0u8; 32]);
    let domain_separator = keccak256(domain);

    let mut agent = Vec::with_capacity(32 * 3);
    agent.extend_from_slice(&keccak256(AGENT_TYPE));
    agent.extend_from_slice(&keccak256(source));
    agent.extend_from_slice(connection_id.as_bytes());
    let struct_hash = keccak256(agent);

    let mut message = Vec::with_capacity(2 + 32 * 2);
    message.extend_from_slice(&[0x19, 0x01]);
    message.extend_from_slice(&domain_separator);
    message.extend_from_slice(&struct_hash);

    H256::from(keccak256(message))
}

fn u256_bytes(value: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

pub fn signature_to_json(signature: &Signature) -> Value {
    json!({
        "r": format!("0x{:x}", signature.r),
        "s": format!("0x{:x}", signature.s),
        "v": signature.v,
    })
}
