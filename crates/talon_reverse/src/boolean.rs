//! Boolean composition over sorted posting streams.
//!
//! Every stream yields `ReverseNode`s in ascending key order through a
//! primed cursor: `peek` exposes the current node, `advance` computes the
//! next one, so executors nest freely (an AND can feed an OR and vice
//! versa). AND intersects by key — a DELETE on any side poisons the result
//! node, which downstream filters drop. OR unions, preferring a surviving
//! NORMAL posting so a document deleted under one term still matches
//! through another.

use crate::node::{NodeFlag, ReverseNode};

/// A sorted stream of postings with a primed cursor.
pub trait NodeStream {
    fn peek(&self) -> Option<&ReverseNode>;
    fn advance(&mut self);

    fn next_node(&mut self) -> Option<ReverseNode> {
        let node = self.peek().cloned();
        if node.is_some() {
            self.advance();
        }
        node
    }
}

/// Stream over a pre-merged, sorted vector.
pub struct VecStream {
    nodes: Vec<ReverseNode>,
    pos: usize,
}

impl VecStream {
    pub fn new(nodes: Vec<ReverseNode>) -> Self {
        Self { nodes, pos: 0 }
    }
}

impl NodeStream for VecStream {
    fn peek(&self) -> Option<&ReverseNode> {
        self.nodes.get(self.pos)
    }

    fn advance(&mut self) {
        if self.pos < self.nodes.len() {
            self.pos += 1;
        }
    }
}

/// Intersection of all child streams.
pub struct AndExecutor {
    children: Vec<Box<dyn NodeStream>>,
    current: Option<ReverseNode>,
}

impl AndExecutor {
    pub fn new(children: Vec<Box<dyn NodeStream>>) -> Self {
        let mut exe = Self { children, current: None };
        exe.current = exe.pull();
        exe
    }

    /// Advance every child to the next key they all share and merge it.
    fn pull(&mut self) -> Option<ReverseNode> {
        if self.children.is_empty() {
            return None;
        }
        loop {
            // Candidate: the maximum of the children's heads.
            let mut target: Option<Vec<u8>> = None;
            for child in &self.children {
                let head = child.peek()?;
                if target.as_ref().map(|t| head.key > *t).unwrap_or(true) {
                    target = Some(head.key.clone());
                }
            }
            let target = target?;
            let mut aligned = true;
            for child in &mut self.children {
                loop {
                    let Some(head) = child.peek().map(|n| n.key.clone()) else {
                        return None;
                    };
                    if head < target {
                        child.advance();
                    } else {
                        if head != target {
                            aligned = false;
                        }
                        break;
                    }
                }
            }
            if !aligned {
                continue;
            }
            let mut out = ReverseNode::normal(target);
            for child in &mut self.children {
                if let Some(n) = child.peek() {
                    if n.flag == NodeFlag::Delete {
                        out.flag = NodeFlag::Delete;
                    }
                    out.weight += n.weight;
                }
                child.advance();
            }
            return Some(out);
        }
    }
}

impl NodeStream for AndExecutor {
    fn peek(&self) -> Option<&ReverseNode> {
        self.current.as_ref()
    }

    fn advance(&mut self) {
        self.current = self.pull();
    }
}

/// Union of all child streams.
pub struct OrExecutor {
    children: Vec<Box<dyn NodeStream>>,
    current: Option<ReverseNode>,
}

impl OrExecutor {
    pub fn new(children: Vec<Box<dyn NodeStream>>) -> Self {
        let mut exe = Self { children, current: None };
        exe.current = exe.pull();
        exe
    }

    fn pull(&mut self) -> Option<ReverseNode> {
        let min_key = self
            .children
            .iter()
            .filter_map(|c| c.peek())
            .map(|n| n.key.clone())
            .min()?;
        let mut out = ReverseNode::delete(min_key.clone());
        for child in &mut self.children {
            loop {
                let Some((matches, flag, weight)) =
                    child.peek().map(|n| (n.key == min_key, n.flag, n.weight))
                else {
                    break;
                };
                if !matches {
                    break;
                }
                if flag == NodeFlag::Normal {
                    out.flag = NodeFlag::Normal;
                    out.weight += weight;
                }
                child.advance();
            }
        }
        Some(out)
    }
}

impl NodeStream for OrExecutor {
    fn peek(&self) -> Option<&ReverseNode> {
        self.current.as_ref()
    }

    fn advance(&mut self) {
        self.current = self.pull();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(keys: &[&[u8]]) -> Box<dyn NodeStream> {
        Box::new(VecStream::new(keys.iter().map(|k| ReverseNode::normal(k.to_vec())).collect()))
    }

    fn drain(mut exe: impl NodeStream) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(n) = exe.next_node() {
            if n.flag == NodeFlag::Normal {
                out.push(n.key);
            }
        }
        out
    }

    #[test]
    fn test_and_intersects_sorted() {
        let exe = AndExecutor::new(vec![
            stream(&[b"1", b"3", b"5", b"7"]),
            stream(&[b"3", b"5", b"9"]),
        ]);
        assert_eq!(drain(exe), vec![b"3".to_vec(), b"5".to_vec()]);
    }

    #[test]
    fn test_and_empty_child_yields_nothing() {
        let exe = AndExecutor::new(vec![stream(&[b"1", b"2"]), stream(&[])]);
        assert_eq!(drain(exe), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_and_delete_poisons_doc() {
        let left = VecStream::new(vec![
            ReverseNode::normal(b"1".to_vec()),
            ReverseNode::delete(b"2".to_vec()),
        ]);
        let right = VecStream::new(vec![
            ReverseNode::normal(b"1".to_vec()),
            ReverseNode::normal(b"2".to_vec()),
        ]);
        let exe = AndExecutor::new(vec![Box::new(left), Box::new(right)]);
        assert_eq!(drain(exe), vec![b"1".to_vec()]);
    }

    #[test]
    fn test_or_unions_dedup() {
        let exe = OrExecutor::new(vec![stream(&[b"1", b"3"]), stream(&[b"2", b"3", b"4"])]);
        assert_eq!(drain(exe), vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
    }

    #[test]
    fn test_or_normal_survives_partial_delete() {
        let left = VecStream::new(vec![ReverseNode::delete(b"9".to_vec())]);
        let right = VecStream::new(vec![ReverseNode::normal(b"9".to_vec())]);
        let exe = OrExecutor::new(vec![Box::new(left), Box::new(right)]);
        assert_eq!(drain(exe), vec![b"9".to_vec()]);
    }

    #[test]
    fn test_nested_and_inside_or() {
        // (A AND B) OR C — the AND must surface only true intersections to
        // its parent.
        let and = AndExecutor::new(vec![stream(&[b"1", b"2"]), stream(&[b"2", b"3"])]);
        let or = OrExecutor::new(vec![Box::new(and), stream(&[b"4"])]);
        assert_eq!(drain(or), vec![b"2".to_vec(), b"4".to_vec()]);
    }

    #[test]
    fn test_nested_or_inside_and() {
        // (A OR B) AND C
        let or = OrExecutor::new(vec![stream(&[b"1"]), stream(&[b"3", b"5"])]);
        let and = AndExecutor::new(vec![Box::new(or), stream(&[b"3", b"4", b"5"])]);
        assert_eq!(drain(and), vec![b"3".to_vec(), b"5".to_vec()]);
    }
}
