use crate::vfs::{FileState, Snapshot};
use colored::Colorize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write;
use std::rc::Rc;

/// Represents a node in the tree (either file or directory).
#[derive(Debug)]
struct TreeNode {
    name: String,
    children: Vec<Rc<RefCell<TreeNode>>>,
    state: Option<FileState>,
}
impl TreeNode {
    fn new(name: String, state: Option<FileState>) -> Self {
        Self {
            name,
            children: Vec::new(),
            state,
        }
    }
}

/// Build the directory tree from the snapshot keys, returning the root node.
fn build_tree(snapshot: &Snapshot, root_name: &str) -> Rc<RefCell<TreeNode>> {
    let root = Rc::new(RefCell::new(TreeNode::new(root_name.to_string(), None)));

    // map directory key to node
    let mut lookup: HashMap<String, Rc<RefCell<TreeNode>>> = HashMap::new();
    lookup.insert(String::new(), Rc::clone(&root));

    for (key, entry) in &snapshot.0 {
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        let Some((file_name, directories)) = segments.split_last() else {
            continue;
        };

        // walk (and create) the parent directories
        let mut parent_key = String::new();
        let mut parent = Rc::clone(&root);
        for directory in directories {
            let child_key = if parent_key.is_empty() {
                directory.to_string()
            } else {
                format!("{}/{}", parent_key, directory)
            };

            let node = match lookup.get(&child_key) {
                Some(node) => Rc::clone(node),
                None => {
                    let node = Rc::new(RefCell::new(TreeNode::new(directory.to_string(), None)));
                    parent.borrow_mut().children.push(Rc::clone(&node));
                    lookup.insert(child_key.clone(), Rc::clone(&node));
                    node
                }
            };

            parent = node;
            parent_key = child_key;
        }

        let leaf = TreeNode::new(file_name.to_string(), Some(entry.state_cleared));
        parent.borrow_mut().children.push(Rc::new(RefCell::new(leaf)));
    }

    root
}

/// Write the tree with a nice ASCII style.
fn render_node(
    node: &Rc<RefCell<TreeNode>>,
    prefix: &str,
    is_last: bool,
    colorize: bool,
    out: &mut String,
) {
    let node_borrow = node.borrow();

    let connector = if is_last { "└── " } else { "├── " };
    let name = match (colorize, node_borrow.state) {
        (false, Some(FileState::Deleted)) => format!("{} (deleted)", node_borrow.name),
        (false, _) => node_borrow.name.clone(),
        (true, None) => node_borrow.name.blue().to_string(),
        (true, Some(FileState::Modified)) => node_borrow.name.green().to_string(),
        (true, Some(FileState::Deleted)) => node_borrow.name.red().strikethrough().to_string(),
    };

    if colorize {
        let _ = writeln!(out, "{}{}{}", prefix.yellow(), connector.yellow(), name);
    } else {
        let _ = writeln!(out, "{}{}{}", prefix, connector, name);
    }

    let child_prefix = if is_last {
        format!("{}    ", prefix)
    } else {
        format!("{}│   ", prefix)
    };

    let len = node_borrow.children.len();
    for (i, child) in node_borrow.children.iter().enumerate() {
        let last = i == len - 1;
        render_node(child, &child_prefix, last, colorize, out);
    }
}

/// Renders `snapshot` as a directory tree rooted at `root_name`.
///
/// Directories are blue, modified files green, deleted files red when `colorize` is set;
/// without colors deleted files carry a `(deleted)` marker.
pub fn render_tree(snapshot: &Snapshot, root_name: &str, colorize: bool) -> String {
    let tree_root = build_tree(snapshot, root_name);

    let mut out = String::new();

    render_node(&tree_root, "", true, colorize, &mut out);

    out
}

pub fn print_tree(snapshot: &Snapshot, root_name: &str) {
    println!(
        "Legend: {} = (directory), {} = (file), {} = (deleted)",
        "blue".blue(),
        "green".green(),
        "red".red()
    );

    println!("{}", render_tree(snapshot, root_name, true));
}
