use std::collections::HashMap;

use crate::Step;

/// Graph structure for traversal and analysis.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Adjacency list: step name -> successors, in declaration order.
  adjacency: HashMap<String, Vec<String>>,
}

impl Graph {
  /// Build a graph from the `next` edges of each step.
  pub fn new(steps: &[Step]) -> Self {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for step in steps {
      adjacency
        .entry(step.name.clone())
        .or_default()
        .extend(step.next.iter().cloned());
    }

    Self { adjacency }
  }

  /// Successors of a step. Order matters: it determines child path ids.
  pub fn successors(&self, step: &str) -> &[String] {
    self
      .adjacency
      .get(step)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// A step with more than one successor ends its path and fans out.
  pub fn is_branch_point(&self, step: &str) -> bool {
    self.successors(step).len() > 1
  }

  /// Find a step that lies on a cycle, using DFS with coloring.
  pub fn find_cycle(&self) -> Option<String> {
    // 0 = white (unvisited), 1 = gray (in progress), 2 = black (done)
    let mut color: HashMap<&str, u8> = self.adjacency.keys().map(|k| (k.as_str(), 0u8)).collect();

    fn dfs<'a>(
      step: &'a str,
      adjacency: &'a HashMap<String, Vec<String>>,
      color: &mut HashMap<&'a str, u8>,
    ) -> Option<&'a str> {
      color.insert(step, 1);

      if let Some(successors) = adjacency.get(step) {
        for next in successors {
          match color.get(next.as_str()) {
            Some(1) => return Some(next.as_str()),
            Some(0) => {
              if let Some(found) = dfs(next.as_str(), adjacency, color) {
                return Some(found);
              }
            }
            _ => {}
          }
        }
      }

      color.insert(step, 2);
      None
    }

    // Sorted so the reported step is stable across runs.
    let mut roots: Vec<&str> = self.adjacency.keys().map(|k| k.as_str()).collect();
    roots.sort_unstable();

    for root in roots {
      if color.get(root) == Some(&0) {
        if let Some(found) = dfs(root, &self.adjacency, &mut color) {
          return Some(found.to_string());
        }
      }
    }

    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn step(name: &str, next: &[&str]) -> Step {
    Step::new(name, "echo").with_next(next.iter().copied())
  }

  #[test]
  fn test_successors_keep_declaration_order() {
    let graph = Graph::new(&[step("a", &["c", "b"]), step("b", &[]), step("c", &[])]);

    assert_eq!(graph.successors("a"), &["c".to_string(), "b".to_string()]);
    assert!(graph.is_branch_point("a"));
    assert!(!graph.is_branch_point("b"));
    assert!(graph.successors("missing").is_empty());
  }

  #[test]
  fn test_find_cycle() {
    let acyclic = Graph::new(&[step("a", &["b"]), step("b", &[])]);
    assert_eq!(acyclic.find_cycle(), None);

    let cyclic = Graph::new(&[step("a", &["b"]), step("b", &["c"]), step("c", &["b"])]);
    assert!(cyclic.find_cycle().is_some());

    let self_loop = Graph::new(&[step("a", &["a"])]);
    assert_eq!(self_loop.find_cycle(), Some("a".to_string()));
  }
}
