use owo_colors::{AnsiColors, OwoColorize};
use std::collections::HashMap;
use std::io::Write;

// Distinct and readable on both light and dark terminals.
const SERVICE_COLORS: [AnsiColors; 8] = [
    AnsiColors::Cyan,
    AnsiColors::Yellow,
    AnsiColors::Green,
    AnsiColors::Blue,
    AnsiColors::Magenta,
    AnsiColors::BrightRed,
    AnsiColors::BrightCyan,
    AnsiColors::BrightYellow,
];

/// Prints log lines with an aligned `name |` prefix, each service in a
/// stable color.
pub struct LogFormatter<W: Write> {
    out: W,
    max_name_len: usize,
    color_enabled: bool,
    assigned: HashMap<String, AnsiColors>,
    next_color: usize,
}

impl<W: Write> LogFormatter<W> {
    pub fn new(out: W, service_names: &[String], color_enabled: bool) -> Self {
        let mut formatter = LogFormatter {
            out,
            max_name_len: service_names.iter().map(|n| n.len()).max().unwrap_or(0),
            color_enabled,
            assigned: HashMap::new(),
            next_color: 0,
        };
        for name in service_names {
            formatter.assign_color(name);
        }
        formatter
    }

    fn assign_color(&mut self, service: &str) -> AnsiColors {
        if let Some(color) = self.assigned.get(service) {
            return *color;
        }
        let color = SERVICE_COLORS[self.next_color % SERVICE_COLORS.len()];
        self.assigned.insert(service.to_string(), color);
        self.next_color += 1;
        color
    }

    pub fn print_line(&mut self, service: &str, line: &str) {
        if service.len() > self.max_name_len {
            self.max_name_len = service.len();
        }
        let color = self.assign_color(service);
        let padded = format!("{service:width$}", width = self.max_name_len);

        let result = if self.color_enabled {
            writeln!(
                self.out,
                "{} {}",
                format!("{padded} |").color(color),
                line
            )
        } else {
            writeln!(self.out, "{padded} | {line}")
        };
        let _ = result;
    }
}
