//! Merkle trees over lowercase hex SHA-256 hashes.
//!
//! Parent nodes hash the two children in sorted order, so a proof is just the
//! list of siblings from leaf to root: the verifier never needs to know which
//! side a sibling was on. An odd node at the end of a level is paired with itself.

use crate::*;

/// Hash of a parent node: SHA-256 over the lexicographically smaller child
/// followed by the larger one.
pub fn node_hash(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut joined = String::with_capacity(first.len() + second.len());
    joined.push_str(first);
    joined.push_str(second);
    sha256_hex(joined.as_bytes())
}

fn next_level(level: &[String]) -> Vec<String> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => node_hash(left, right),
            [odd] => node_hash(odd, odd),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Root over `leaves`, or `None` for an empty tree. A single leaf is its own root.
pub fn merkle_root(leaves: &[String]) -> Option<String> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level.pop()
}

/// Sibling hashes for the leaf at `index`, leaf level first.
pub fn inclusion_proof(leaves: &[String], index: usize) -> Option<Vec<String>> {
    if index >= leaves.len() {
        return None;
    }
    let mut proof = Vec::new();
    let mut level = leaves.to_vec();
    let mut position = index;
    while level.len() > 1 {
        let sibling = position ^ 1;
        let sibling_hash = level.get(sibling).unwrap_or(&level[position]);
        proof.push(sibling_hash.clone());
        level = next_level(&level);
        position /= 2;
    }
    Some(proof)
}

pub fn verify_inclusion(leaf: &str, proof: &[String], root: &str) -> bool {
    let computed = proof
        .iter()
        .fold(leaf.to_owned(), |acc, sibling| node_hash(&acc, sibling));
    computed == root
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| sha256_hex(format!("leaf {}", i).as_bytes())).collect()
    }

    #[test]
    fn test_small_trees() {
        assert_eq!(merkle_root(&[]), None);

        let one = leaves(1);
        assert_eq!(merkle_root(&one).unwrap(), one[0]);
        assert!(inclusion_proof(&one, 0).unwrap().is_empty());

        let three = leaves(3);
        let left = node_hash(&three[0], &three[1]);
        let right = node_hash(&three[2], &three[2]);
        assert_eq!(merkle_root(&three).unwrap(), node_hash(&left, &right));
        assert_eq!(
            inclusion_proof(&three, 2).unwrap(),
            vec![three[2].clone(), left]
        );
        assert_eq!(inclusion_proof(&three, 3), None);
    }

    #[test]
    fn test_node_hash_is_order_free() {
        let l = leaves(2);
        assert_eq!(node_hash(&l[0], &l[1]), node_hash(&l[1], &l[0]));
    }

    proptest! {
        #[test]
        fn every_leaf_proves_against_the_root(count in 1usize..48, pick in any::<prop::sample::Index>()) {
            let leaves = leaves(count);
            let index = pick.index(count);
            let root = merkle_root(&leaves).unwrap();
            let proof = inclusion_proof(&leaves, index).unwrap();
            prop_assert!(verify_inclusion(&leaves[index], &proof, &root));
        }

        #[test]
        fn foreign_leaf_does_not_prove(count in 2usize..48, pick in any::<prop::sample::Index>()) {
            let leaves = leaves(count);
            let index = pick.index(count);
            let root = merkle_root(&leaves).unwrap();
            let proof = inclusion_proof(&leaves, index).unwrap();
            let outsider = sha256_hex(b"not in the tree");
            prop_assert!(!verify_inclusion(&outsider, &proof, &root));
        }
    }
}
