use crate::options::{OptionError, OptionPath};

/// A configurable option, a section of options, or a multi-instance option
///
/// For a multi-instance node, `children` is the template every new instance starts from.
#[derive(Debug, Clone)]
pub struct OptionNode {
    name: String,
    description: String,
    value: Option<String>,
    read_only: bool,
    multi: bool,
    children: Vec<OptionNode>,
    instances: Vec<Instance>,
}

#[derive(Debug, Clone)]
struct Instance {
    name: String,
    value: Option<String>,
    children: Vec<OptionNode>,
}

/// One entry of a LIST reply
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct Listing {
    pub name: String,
    pub description: String,
    pub value: Option<String>,
    pub children: Vec<Listing>,
}

impl OptionNode {
    pub fn value(name: &str, description: &str, default: Option<&str>) -> Self {
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            value: default.map(str::to_owned),
            read_only: false,
            multi: false,
            children: Vec::new(),
            instances: Vec::new(),
        }
    }

    pub fn section(name: &str, description: &str) -> Self {
        Self::value(name, description, None)
    }

    pub fn multi(name: &str, description: &str) -> Self {
        Self {
            multi: true,
            ..Self::value(name, description, None)
        }
    }

    pub fn with_child(mut self, child: OptionNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_value(&self) -> bool {
        !self.multi && self.children.is_empty()
    }

    fn listing(&self) -> Listing {
        let children = if self.multi {
            self.instances.iter().map(Instance::listing).collect()
        } else {
            self.children.iter().map(OptionNode::listing).collect()
        };
        Listing {
            name: self.name.clone(),
            description: self.description.clone(),
            value: self.value.clone(),
            children,
        }
    }
}

impl Instance {
    fn listing(&self) -> Listing {
        Listing {
            name: self.name.clone(),
            description: String::new(),
            value: self.value.clone(),
            children: self.children.iter().map(OptionNode::listing).collect(),
        }
    }
}

enum Target<'a> {
    Node(&'a OptionNode),
    Instance(&'a Instance),
    /// An instance of this node that doesn't exist yet
    NewInstance(&'a OptionNode),
}

enum TargetMut<'a> {
    Node(&'a mut OptionNode),
    Instance(&'a mut Instance),
}

/// Options an analyzer exposes to administrative requests
#[derive(Debug, Clone, Default)]
pub struct OptionTree {
    roots: Vec<OptionNode>,
}

impl OptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: OptionNode) -> &mut Self {
        self.roots.push(node);
        self
    }

    /// Resolves `path`. With `create`, a missing instance resolves to its template.
    fn walk<'a>(&'a self, path: &OptionPath, create: bool) -> Result<Target<'a>, OptionError> {
        let count = path.segments().len();
        let mut nodes: &'a [OptionNode] = &self.roots;
        for (i, seg) in path.segments().iter().enumerate() {
            let node = nodes
                .iter()
                .find(|n| n.name == seg.name)
                .ok_or_else(|| OptionError::UnknownOption(path.prefix(i + 1)))?;
            let target = match &seg.instance {
                None if node.multi && i + 1 < count => {
                    return Err(OptionError::InstanceRequired(path.prefix(i + 1)))
                }
                None => Target::Node(node),
                Some(_) if !node.multi => return Err(OptionError::NotMultiple(path.prefix(i + 1))),
                Some(name) => match node.instances.iter().find(|x| &x.name == name) {
                    Some(instance) => Target::Instance(instance),
                    None if create => Target::NewInstance(node),
                    None => {
                        return Err(OptionError::UnknownInstance(
                            seg.name.clone(),
                            name.clone(),
                        ))
                    }
                },
            };
            if i + 1 == count {
                return Ok(target);
            }
            nodes = match target {
                Target::Node(n) | Target::NewInstance(n) => n.children.as_slice(),
                Target::Instance(x) => x.children.as_slice(),
            };
        }
        Err(OptionError::InvalidPath(path.to_string()))
    }

    /// Like `walk`, but creates missing instances along the way.
    /// Callers check the path with `walk(path, true)` first, so nothing is created for
    /// a path that fails further down.
    fn walk_mut<'a>(&'a mut self, path: &OptionPath) -> Result<TargetMut<'a>, OptionError> {
        let count = path.segments().len();
        let mut nodes: &'a mut [OptionNode] = &mut self.roots;
        for (i, seg) in path.segments().iter().enumerate() {
            let node = std::mem::take(&mut nodes)
                .iter_mut()
                .find(|n| n.name == seg.name)
                .ok_or_else(|| OptionError::UnknownOption(path.prefix(i + 1)))?;
            let target = match &seg.instance {
                None if node.multi && i + 1 < count => {
                    return Err(OptionError::InstanceRequired(path.prefix(i + 1)))
                }
                None => TargetMut::Node(node),
                Some(_) if !node.multi => return Err(OptionError::NotMultiple(path.prefix(i + 1))),
                Some(name) => {
                    let pos = match node.instances.iter().position(|x| &x.name == name) {
                        Some(pos) => pos,
                        None => {
                            let children = node.children.clone();
                            node.instances.push(Instance {
                                name: name.clone(),
                                value: None,
                                children,
                            });
                            node.instances.len() - 1
                        }
                    };
                    TargetMut::Instance(&mut node.instances[pos])
                }
            };
            if i + 1 == count {
                return Ok(target);
            }
            nodes = match target {
                TargetMut::Node(n) => n.children.as_mut_slice(),
                TargetMut::Instance(x) => x.children.as_mut_slice(),
            };
        }
        Err(OptionError::InvalidPath(path.to_string()))
    }

    pub fn get(&self, path: &OptionPath) -> Result<String, OptionError> {
        let value = match self.walk(path, false)? {
            Target::Node(node) if !node.is_value() => {
                return Err(OptionError::NotAValue(path.to_string()))
            }
            Target::Node(node) => node.value.clone(),
            Target::Instance(instance) => instance.value.clone(),
            Target::NewInstance(_) => None,
        };
        value.ok_or_else(|| OptionError::NoValue(path.to_string()))
    }

    /// Sets a value. Naming a missing instance creates it.
    pub fn set(&mut self, path: &OptionPath, value: &str) -> Result<(), OptionError> {
        match self.walk(path, true)? {
            Target::Node(node) if node.read_only => {
                return Err(OptionError::ReadOnly(path.to_string()))
            }
            Target::Node(node) if !node.is_value() => {
                return Err(OptionError::NotAValue(path.to_string()))
            }
            _ => {}
        }
        self.store(path, value)
    }

    /// Updates a value from the analyzer itself, read-only or not
    pub fn update(&mut self, path: &OptionPath, value: &str) -> Result<(), OptionError> {
        self.walk(path, true)?;
        self.store(path, value)
    }

    fn store(&mut self, path: &OptionPath, value: &str) -> Result<(), OptionError> {
        match self.walk_mut(path)? {
            TargetMut::Node(node) => node.value = Some(value.to_owned()),
            TargetMut::Instance(instance) => instance.value = Some(value.to_owned()),
        }
        Ok(())
    }

    /// The whole tree, or the subtree at `path`
    pub fn list(&self, path: Option<&OptionPath>) -> Result<Vec<Listing>, OptionError> {
        match path {
            None => Ok(self.roots.iter().map(OptionNode::listing).collect()),
            Some(path) => Ok(vec![match self.walk(path, false)? {
                Target::Node(node) => node.listing(),
                Target::Instance(instance) => instance.listing(),
                Target::NewInstance(node) => node.listing(),
            }]),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> OptionTree {
        let mut tree = OptionTree::new();
        tree.add(
            OptionNode::section("manager", "Manager connection")
                .with_child(OptionNode::value("address", "Manager address", Some("unix")))
                .with_child(OptionNode::value("id", "Analyzer id", Some("42")).read_only()),
        )
        .add(
            OptionNode::multi("log", "Log files to monitor")
                .with_child(OptionNode::value("level", "Minimum level", Some("info"))),
        );
        tree
    }

    fn path(s: &str) -> OptionPath {
        s.parse().unwrap()
    }

    #[test]
    fn get_and_set() {
        let mut tree = sample();
        assert_eq!(tree.get(&path("manager.address")).unwrap(), "unix");
        tree.set(&path("manager.address"), "10.0.0.1").unwrap();
        assert_eq!(tree.get(&path("manager.address")).unwrap(), "10.0.0.1");

        assert!(matches!(
            tree.set(&path("manager.id"), "7"),
            Err(OptionError::ReadOnly(_))
        ));
        tree.update(&path("manager.id"), "7").unwrap();
        assert_eq!(tree.get(&path("manager.id")).unwrap(), "7");
    }

    #[test]
    fn instances_are_created_on_set() {
        let mut tree = sample();
        assert!(matches!(
            tree.get(&path("log[/var/log/messages].level")),
            Err(OptionError::UnknownInstance(..))
        ));
        tree.set(&path("log[/var/log/messages].level"), "debug").unwrap();
        assert_eq!(
            tree.get(&path("log[/var/log/messages].level")).unwrap(),
            "debug"
        );
        tree.set(&path("log[/var/log/auth.log]"), "enabled").unwrap();
        assert_eq!(tree.get(&path("log[/var/log/auth.log]")).unwrap(), "enabled");
        // New instances start from the template
        assert_eq!(tree.get(&path("log[/var/log/auth.log].level")).unwrap(), "info");
    }

    #[test]
    fn errors_name_the_problem() {
        let mut tree = sample();
        assert!(matches!(
            tree.get(&path("nope")),
            Err(OptionError::UnknownOption(p)) if p == "nope"
        ));
        assert!(matches!(
            tree.get(&path("manager")),
            Err(OptionError::NotAValue(_))
        ));
        assert!(matches!(
            tree.get(&path("log.level")),
            Err(OptionError::InstanceRequired(_))
        ));
        assert!(matches!(
            tree.set(&path("manager[x].address"), "a"),
            Err(OptionError::NotMultiple(_))
        ));
        assert!(matches!(
            tree.get(&path("manager.address.deeper")),
            Err(OptionError::UnknownOption(_))
        ));
    }

    #[test]
    fn failed_set_creates_no_instance() {
        let mut tree = sample();
        assert!(matches!(
            tree.set(&path("log[x].nope"), "a"),
            Err(OptionError::UnknownOption(p)) if p == "log[x].nope"
        ));
        assert!(matches!(
            tree.get(&path("log[x]")),
            Err(OptionError::UnknownInstance(..))
        ));
        assert!(tree.list(Some(&path("log"))).unwrap()[0].children.is_empty());

        assert!(tree.update(&path("log[y].level.deeper"), "a").is_err());
        assert!(tree.list(Some(&path("log"))).unwrap()[0].children.is_empty());
    }

    #[test]
    fn listing() {
        let mut tree = sample();
        tree.set(&path("log[a].level"), "warn").unwrap();
        let all = tree.list(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].children.len(), 2);
        assert_eq!(all[1].children[0].name, "a");
        assert_eq!(all[1].children[0].children[0].value.as_deref(), Some("warn"));

        let sub = tree.list(Some(&path("manager"))).unwrap();
        assert_eq!(sub[0].name, "manager");
        assert_eq!(sub[0].children[0].value.as_deref(), Some("unix"));
    }
}
