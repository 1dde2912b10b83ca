//! Dependency graph ordering and cycle detection

use std::collections::HashSet;
use std::hash::Hash;

/// Order `objects` so every object comes after its dependencies.
///
/// Dependencies outside `objects` are ignored. On a cycle the members of the
/// first cycle found are returned, in traversal order.
pub fn topological_order<T, F>(objects: &[T], dependencies: F) -> Result<Vec<T>, Vec<T>>
where
    T: Clone + Eq + Hash,
    F: Fn(&T) -> Vec<T>,
{
    let members: HashSet<&T> = objects.iter().collect();
    let mut order = Vec::with_capacity(objects.len());
    let mut visited = HashSet::new();
    let mut visiting = Vec::new();

    for object in objects {
        visit(
            object,
            &members,
            &dependencies,
            &mut visited,
            &mut visiting,
            &mut order,
        )?;
    }

    Ok(order)
}

fn visit<T, F>(
    object: &T,
    members: &HashSet<&T>,
    dependencies: &F,
    visited: &mut HashSet<T>,
    visiting: &mut Vec<T>,
    order: &mut Vec<T>,
) -> Result<(), Vec<T>>
where
    T: Clone + Eq + Hash,
    F: Fn(&T) -> Vec<T>,
{
    if visited.contains(object) {
        return Ok(());
    }

    if let Some(start) = visiting.iter().position(|o| o == object) {
        return Err(visiting[start..].to_vec());
    }

    visiting.push(object.clone());

    for dep in dependencies(object) {
        if members.contains(&dep) {
            visit(&dep, members, dependencies, visited, visiting, order)?;
        }
    }

    visiting.pop();
    visited.insert(object.clone());
    order.push(object.clone());

    Ok(())
}

/// Members of a dependency cycle, if there is one
pub fn find_cycle<T, F>(objects: &[T], dependencies: F) -> Option<Vec<T>>
where
    T: Clone + Eq + Hash,
    F: Fn(&T) -> Vec<T>,
{
    topological_order(objects, dependencies).err()
}
