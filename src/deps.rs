use crate::config::Service;
use std::collections::HashMap;

/// Look for a dependency cycle. Returns the cycle path with the entry node
/// repeated at both ends (e.g. `[a, b, a]`), or `None` for a DAG.
///
/// Runs at config validation time; the resolvers below assume an acyclic
/// graph.
pub fn detect_cycle(services: &HashMap<String, Service>) -> Option<Vec<String>> {
    // 0 = unvisited, 1 = on the current path, 2 = fully explored
    let mut state: HashMap<&str, u8> = HashMap::new();

    fn visit<'a>(
        name: &'a str,
        services: &'a HashMap<String, Service>,
        state: &mut HashMap<&'a str, u8>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match state.get(name) {
            Some(2) => return None,
            Some(1) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            _ => {}
        }

        state.insert(name, 1);
        path.push(name);

        if let Some(svc) = services.get(name) {
            for dep in &svc.depends_on {
                if let Some(cycle) = visit(dep, services, state, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        state.insert(name, 2);
        None
    }

    let mut names: Vec<&String> = services.keys().collect();
    names.sort();

    for name in names {
        let mut path = Vec::new();
        if let Some(cycle) = visit(name, services, &mut state, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Expand `targets` to their forward closure (all transitive dependencies)
/// in topological order: dependencies before dependents. Empty targets mean
/// every service. Names without a definition pass through so the caller can
/// report them.
pub fn start_order(services: &HashMap<String, Service>, targets: &[String]) -> Vec<String> {
    let roots = seed(services, targets);

    let mut visited: HashMap<&str, bool> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    fn visit<'a>(
        name: &'a str,
        services: &'a HashMap<String, Service>,
        visited: &mut HashMap<&'a str, bool>,
        order: &mut Vec<String>,
    ) {
        if visited.contains_key(name) {
            return;
        }
        visited.insert(name, true);

        if let Some(svc) = services.get(name) {
            for dep in &svc.depends_on {
                visit(dep, services, visited, order);
            }
        }
        order.push(name.to_string());
    }

    for root in &roots {
        visit(root, services, &mut visited, &mut order);
    }
    order
}

/// Expand `targets` to their reverse closure (all transitive dependents) in
/// reverse topological order: dependents before their dependencies, so a
/// stop sweep never pulls a service out from under something that needs it.
/// Empty targets mean every service.
pub fn stop_order(services: &HashMap<String, Service>, targets: &[String]) -> Vec<String> {
    if targets.is_empty() {
        let mut order = start_order(services, &[]);
        order.reverse();
        return order;
    }

    // dep -> services that declare it
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, svc) in services {
        for dep in &svc.depends_on {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }
    for list in dependents.values_mut() {
        list.sort();
    }

    let mut visited: HashMap<&str, bool> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    fn visit<'a>(
        name: &'a str,
        dependents: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashMap<&'a str, bool>,
        order: &mut Vec<String>,
    ) {
        if visited.contains_key(name) {
            return;
        }
        visited.insert(name, true);

        if let Some(users) = dependents.get(name) {
            for user in users {
                visit(user, dependents, visited, order);
            }
        }
        order.push(name.to_string());
    }

    for target in seed(services, targets) {
        visit(target, &dependents, &mut visited, &mut order);
    }
    order
}

fn seed<'a>(services: &'a HashMap<String, Service>, targets: &'a [String]) -> Vec<&'a str> {
    if targets.is_empty() {
        let mut names: Vec<&str> = services.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    } else {
        targets.iter().map(|s| s.as_str()).collect()
    }
}
